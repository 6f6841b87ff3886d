//! Zona temporal de subidas.
//!
//! Los ficheros subidos antes de guardar el registro se dejan en
//! `<raíz>/<sesión>/<formulario>/` y se referencian como `tmp://<nombre>`
//! hasta que la reconciliación los mueve a su carpeta definitiva.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    errors::{ElasticError, Result},
    models::TEMP_MARKER,
    uploads::{PendingUpload, UploadSource},
};

/// Fichero presente en la zona temporal.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl StagedFile {
    fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| ElasticError::InvalidName(path.display().to_string()))?;
        let uploaded_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        Ok(Self {
            name,
            path: path.to_path_buf(),
            size: metadata.len(),
            uploaded_at,
        })
    }

    /// Referencia con marcador temporal, tal como la envía el formulario.
    pub fn reference(&self) -> String {
        format!("{TEMP_MARKER}{}", self.name)
    }
}

impl PendingUpload for StagedFile {
    fn original_name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn save_to(&self, destination: &Path) -> std::io::Result<()> {
        fs::copy(&self.path, destination)?;
        Ok(())
    }

    fn release(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => {
                debug!("Subida temporal liberada: {}", self.path.display());
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TempUploadArea {
    root: PathBuf,
}

impl TempUploadArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Carpeta de una sesión y un formulario.
    pub fn dir(&self, session: &str, id: &str) -> Result<PathBuf> {
        Ok(self.root.join(segment(session)?).join(segment(id)?))
    }

    /// Guarda el contenido subido y devuelve el fichero temporal.
    pub fn store(&self, session: &str, id: &str, name: &str, bytes: &[u8]) -> Result<StagedFile> {
        let dir = self.dir(session, id)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name(name)?);
        fs::write(&path, bytes)?;
        debug!("Subida temporal guardada: {}", path.display());
        StagedFile::from_path(&path)
    }

    /// Ruta de una referencia `tmp://nombre` (el marcador es opcional).
    pub fn resolve(&self, session: &str, id: &str, reference: &str) -> Result<PathBuf> {
        Ok(self.dir(session, id)?.join(file_name(reference)?))
    }

    pub fn find(&self, session: &str, id: &str, reference: &str) -> Result<Option<StagedFile>> {
        let path = self.resolve(session, id, reference)?;
        if path.is_file() {
            StagedFile::from_path(&path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Borra un fichero temporal; `false` si no existía.
    pub fn remove(&self, session: &str, id: &str, reference: &str) -> Result<bool> {
        let path = self.resolve(session, id, reference)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!("Subida temporal borrada: {}", path.display());
        Ok(true)
    }

    pub fn list(&self, session: &str, id: &str) -> Result<Vec<StagedFile>> {
        let dir = self.dir(session, id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<StagedFile> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| StagedFile::from_path(e.path()).ok())
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Borra los ficheros temporales más antiguos que `max_age`.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        if !self.root.is_dir() {
            return 0;
        }
        let limit = Utc::now() - max_age;
        let mut purged = 0;
        for entry in WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(staged) = StagedFile::from_path(entry.path()) else {
                continue;
            };
            if staged.uploaded_at >= limit {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => purged += 1,
                Err(err) => warn!("No se pudo purgar {}: {err}", entry.path().display()),
            }
        }
        if purged > 0 {
            info!("Purgadas {purged} subidas temporales abandonadas");
        }
        purged
    }

    pub fn upload_source<'a>(&'a self, session: &'a str, id: &'a str) -> TempUploadSource<'a> {
        TempUploadSource {
            area: self,
            session,
            id,
        }
    }
}

/// Entrega como subidas pendientes los ficheros temporales citados por los
/// valores `tmp://` de un atributo.
#[derive(Debug, Clone, Copy)]
pub struct TempUploadSource<'a> {
    area: &'a TempUploadArea,
    session: &'a str,
    id: &'a str,
}

impl UploadSource for TempUploadSource<'_> {
    fn pending_uploads(&self, attribute: &str, submitted: &[String]) -> Result<Vec<Box<dyn PendingUpload>>> {
        let staged = self.area.list(self.session, self.id)?;
        let mut pending: Vec<Box<dyn PendingUpload>> = Vec::new();
        for value in submitted {
            let Some(name) = value.strip_prefix(TEMP_MARKER) else {
                continue;
            };
            match staged.iter().find(|f| f.name.eq_ignore_ascii_case(name)) {
                Some(file) => pending.push(Box::new(file.clone())),
                None => warn!("'{attribute}': la subida temporal '{name}' ya no existe"),
            }
        }
        Ok(pending)
    }
}

fn segment(value: &str) -> Result<&str> {
    if value.is_empty() || value == "." || value == ".." || value.contains(|c: char| c == '/' || c == '\\') {
        return Err(ElasticError::InvalidName(value.to_string()));
    }
    Ok(value)
}

fn file_name(raw: &str) -> Result<String> {
    let stripped = raw.strip_prefix(TEMP_MARKER).unwrap_or(raw);
    segment(stripped).map(str::to_lowercase)
}
