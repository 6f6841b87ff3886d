//! Reconciliación de atributos con ficheros adjuntos.
//!
//! Compara los valores previos de un atributo con los enviados, coloca las
//! subidas pendientes en su carpeta definitiva (renombrando si el nombre ya
//! existe) y calcula qué ficheros quedan huérfanos. El borrado se difiere
//! hasta que el guardado del registro termina bien.
//!
//! Nota: no hay bloqueo alrededor de la carpeta de destino. Dos peticiones
//! concurrentes sobre el mismo atributo pueden pisarse (gana la última).

use std::{
    collections::HashSet,
    fs,
    path::{Component, Path, PathBuf},
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::{ElasticError, Result},
    models::{AttributeValue, FileCardinality, FileDeclaration, TEMP_MARKER},
};

/// Fichero subido que aún no está en su sitio definitivo.
pub trait PendingUpload: std::fmt::Debug {
    fn original_name(&self) -> &str;
    fn size(&self) -> u64;
    /// Copia la subida a su destino. El origen se conserva hasta `release`.
    fn save_to(&self, destination: &Path) -> std::io::Result<()>;

    /// Libera el origen una vez confirmado el guardado.
    fn release(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Origen de subidas pendientes para un atributo del registro.
pub trait UploadSource {
    fn pending_uploads(
        &self,
        attribute: &str,
        submitted: &[String],
    ) -> Result<Vec<Box<dyn PendingUpload>>>;
}

/// Origen vacío, para guardados sin subidas.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUploads;

impl UploadSource for NoUploads {
    fn pending_uploads(&self, _: &str, _: &[String]) -> Result<Vec<Box<dyn PendingUpload>>> {
        Ok(Vec::new())
    }
}

/// Sustitución literal de marcadores (`{id}`) en rutas y URLs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathParameters(Vec<(String, String)>);

impl PathParameters {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn expand(&self, template: &str) -> String {
        self.0
            .iter()
            .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Destino concreto de un atributo, con los marcadores ya expandidos.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTarget {
    pub cardinality: FileCardinality,
    pub as_string: bool,
    pub target_path: PathBuf,
    pub target_url: String,
}

impl FileTarget {
    /// Las rutas relativas cuelgan de la raíz web; sin ruta, la raíz web.
    pub fn resolve(declaration: &FileDeclaration, web_root: &Path, params: &PathParameters) -> Self {
        let target_path = match &declaration.target_path_alias {
            Some(alias) => {
                let expanded = PathBuf::from(params.expand(alias));
                if expanded.is_absolute() {
                    expanded
                } else {
                    web_root.join(expanded)
                }
            }
            None => web_root.to_path_buf(),
        };
        Self {
            cardinality: declaration.cardinality,
            as_string: declaration.as_string,
            target_path,
            target_url: params.expand(&declaration.target_url),
        }
    }

    pub fn reference_for(&self, file_name: &str) -> String {
        format!("{}{}", self.target_url, file_name)
    }

    /// Ruta en disco de una referencia almacenada; `None` si saldría de la
    /// carpeta de destino.
    pub fn path_for(&self, reference: &str) -> Option<PathBuf> {
        let relative = if self.target_url.is_empty() {
            reference
        } else {
            reference.strip_prefix(&self.target_url).unwrap_or(reference)
        };
        is_confined(relative).then(|| self.target_path.join(relative))
    }

    pub fn ensure_directory(&self) -> Result<()> {
        if !self.target_path.is_dir() {
            fs::create_dir_all(&self.target_path)?;
            info!("Carpeta de ficheros creada: {}", self.target_path.display());
        }
        Ok(())
    }

    /// Forma final del valor según la cardinalidad.
    fn shape(&self, attribute: &str, mut references: Vec<String>) -> Result<AttributeValue> {
        match self.cardinality {
            FileCardinality::Single => match references.len() {
                0 => Ok(AttributeValue::Null),
                1 => Ok(AttributeValue::Text(references.remove(0))),
                count => Err(ElasticError::AmbiguousSingleValue {
                    attribute: attribute.to_string(),
                    count,
                }),
            },
            FileCardinality::Multiple if self.as_string => Ok(AttributeValue::Text(references.join(","))),
            FileCardinality::Multiple => Ok(AttributeValue::List(references)),
        }
    }
}

/// Normaliza un valor de atributo a lista de referencias.
pub fn file_list(value: &AttributeValue, as_string: bool) -> Vec<String> {
    match value {
        AttributeValue::Null => Vec::new(),
        AttributeValue::Text(text) if as_string => text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        AttributeValue::List(items) => items.iter().filter(|i| !i.is_empty()).cloned().collect(),
        other => {
            let single = other.to_string();
            if single.is_empty() {
                Vec::new()
            } else {
                vec![single]
            }
        }
    }
}

/// Resultado de una reconciliación ya aplicada en disco.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub final_value: AttributeValue,
    /// Ficheros colocados en esta pasada.
    pub persisted: Vec<PathBuf>,
    /// Referencias previas que han quedado huérfanas.
    pub to_delete: Vec<String>,
}

#[derive(Debug)]
struct PlannedUpload {
    upload: usize,
    destination: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileAttachmentReconciler {
    attribute: String,
    target: FileTarget,
}

impl FileAttachmentReconciler {
    pub fn new(attribute: impl Into<String>, target: FileTarget) -> Self {
        Self {
            attribute: attribute.into(),
            target,
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn target(&self) -> &FileTarget {
        &self.target
    }

    pub fn reconcile(
        &self,
        previous: &[String],
        submitted: &AttributeValue,
        uploads: &[Box<dyn PendingUpload>],
    ) -> Result<Reconciliation> {
        let submitted = file_list(submitted, self.target.as_string);

        // Valores enviados: los nombres nuevos se cualifican con la URL destino.
        let mut references: Vec<String> = Vec::with_capacity(submitted.len() + uploads.len());
        for value in submitted {
            let reference = if value.starts_with(TEMP_MARKER) || previous.contains(&value) {
                value
            } else if is_confined(&value) {
                self.target.reference_for(&value)
            } else {
                warn!("'{}': se descarta '{value}', sale de la carpeta de destino", self.attribute);
                continue;
            };
            if !references.contains(&reference) {
                references.push(reference);
            }
        }

        let mut planned = Vec::with_capacity(uploads.len());
        let mut claimed = HashSet::new();
        for (index, upload) in uploads.iter().enumerate() {
            let name = clean_name(upload.original_name())?;
            let (final_name, destination) = self.disambiguate(&name, &claimed);
            claimed.insert(destination.clone());

            let reference = self.target.reference_for(&final_name);
            let marker = format!("{TEMP_MARKER}{name}");
            match references.iter().position(|r| r.eq_ignore_ascii_case(&marker)) {
                Some(slot) => references[slot] = reference,
                None => references.push(reference),
            }
            planned.push(PlannedUpload { upload: index, destination });
        }

        let to_delete: Vec<String> = previous
            .iter()
            .filter(|p| !p.starts_with(TEMP_MARKER) && !references.contains(*p))
            .cloned()
            .collect();

        // La forma final se comprueba antes de tocar el disco.
        let final_value = self.target.shape(&self.attribute, references)?;
        let persisted = self.persist(&planned, uploads)?;

        debug!(
            "Atributo '{}': {} ficheros colocados, {} pendientes de borrar",
            self.attribute,
            persisted.len(),
            to_delete.len()
        );
        Ok(Reconciliation {
            final_value,
            persisted,
            to_delete,
        })
    }

    /// Coloca las subidas; ante el primer fallo deshace lo ya colocado.
    fn persist(&self, planned: &[PlannedUpload], uploads: &[Box<dyn PendingUpload>]) -> Result<Vec<PathBuf>> {
        if planned.is_empty() {
            return Ok(Vec::new());
        }
        self.target.ensure_directory()?;

        let mut placed = Vec::with_capacity(planned.len());
        for plan in planned {
            let upload = &uploads[plan.upload];
            if let Err(source) = upload.save_to(&plan.destination) {
                self.rollback(&placed);
                return Err(ElasticError::FileUpload {
                    name: upload.original_name().to_string(),
                    destination: plan.destination.clone(),
                    source,
                });
            }
            info!("Fichero colocado: {}", plan.destination.display());
            placed.push(plan.destination.clone());
        }
        Ok(placed)
    }

    fn disambiguate(&self, name: &str, claimed: &HashSet<PathBuf>) -> (String, PathBuf) {
        let taken = |path: &Path| path.exists() || claimed.contains(path);

        let candidate = self.target.target_path.join(name);
        if !taken(candidate.as_path()) {
            return (name.to_string(), candidate);
        }

        let path = Path::new(name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
        let extension = path.extension().and_then(|s| s.to_str());
        loop {
            let token = unique_token();
            let renamed = match extension {
                Some(ext) => format!("{stem}-{token}.{ext}"),
                None => format!("{stem}-{token}"),
            };
            let candidate = self.target.target_path.join(&renamed);
            if !taken(candidate.as_path()) {
                debug!("'{name}' ya existe, se guarda como '{renamed}'");
                return (renamed, candidate);
            }
        }
    }

    /// Borra las copias colocadas en una pasada que no llegó a confirmarse.
    /// Los orígenes siguen intactos.
    pub fn rollback(&self, placed: &[PathBuf]) {
        for path in placed {
            if let Err(err) = fs::remove_file(path) {
                warn!("No se pudo deshacer {}: {err}", path.display());
            }
        }
    }

    /// Rutas en disco de las referencias huérfanas, sin marcadores temporales
    /// ni referencias que salgan de la carpeta de destino.
    pub fn deletion_paths(&self, references: &[String]) -> Vec<PathBuf> {
        references
            .iter()
            .filter(|r| !r.starts_with(TEMP_MARKER))
            .filter_map(|r| {
                let path = self.target.path_for(r);
                if path.is_none() {
                    warn!("'{}': no se borra '{r}', sale de la carpeta de destino", self.attribute);
                }
                path
            })
            .collect()
    }
}

/// Libera los orígenes de las subidas ya confirmadas.
pub fn release_uploads(uploads: &[Box<dyn PendingUpload>]) {
    for upload in uploads {
        if let Err(err) = upload.release() {
            warn!("No se pudo liberar la subida '{}': {err}", upload.original_name());
        }
    }
}

/// Borra los ficheros indicados; devuelve cuántos se borraron.
pub fn delete_files(paths: &[PathBuf]) -> usize {
    let mut deleted = 0;
    for path in paths {
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Fichero borrado: {}", path.display());
                deleted += 1;
            }
            Err(err) => warn!("No se pudo borrar {}: {err}", path.display()),
        }
    }
    deleted
}

/// Ruta relativa sin raíz, prefijos ni `..`.
fn is_confined(relative: &str) -> bool {
    let path = Path::new(relative);
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Nombre de fichero en minúsculas, sin marcador ni componentes de ruta.
fn clean_name(raw: &str) -> Result<String> {
    let stripped = raw.strip_prefix(TEMP_MARKER).unwrap_or(raw);
    Path::new(stripped)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_lowercase)
        .ok_or_else(|| ElasticError::InvalidName(raw.to_string()))
}

fn unique_token() -> String {
    Uuid::new_v4().simple().to_string()[..13].to_string()
}
