//! Almacén de atributos elásticos de un registro.
//!
//! Guarda los valores de los atributos definidos por la plantilla, los
//! serializa a una sola columna de texto del registro anfitrión y engancha la
//! reconciliación de ficheros a su ciclo de vida (validar, guardar, leer,
//! borrar).

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    config::ElasticConfig,
    content::{expand_images, ImageRenderer},
    errors::{ElasticError, ErrorSet, Result},
    models::{AttributeValue, FileDeclaration, Rule, SchemaTemplateSpec},
    schema::{SchemaTemplateResolver, TemplateSource},
    uploads::{
        delete_files, file_list, release_uploads, FileAttachmentReconciler, FileTarget, PathParameters,
        PendingUpload, UploadSource,
    },
    validation::{run_rules, safe_attribute_names},
};

static NULL: AttributeValue = AttributeValue::Null;

/// Registro anfitrión: dueño del escenario, de la columna de almacenamiento
/// y de la colección de errores.
pub trait RecordHost {
    fn scenario(&self) -> &str;
    fn is_new_record(&self) -> bool;
    fn column(&self, name: &str) -> Option<String>;
    fn set_column(&mut self, name: &str, value: String);
    fn add_error(&mut self, attribute: &str, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Unconfigured,
    Configured,
    Loaded,
    New,
}

/// Resultado de `after_save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Registro nuevo: la columna se reescribió tras colocar los ficheros y
    /// el anfitrión debe guardarlo otra vez.
    ResaveRequired,
}

#[derive(Debug)]
struct FileAttributeState {
    attribute: String,
    declaration: FileDeclaration,
    original_values: Vec<String>,
    pending_deletions: Vec<PathBuf>,
    /// Subidas ya copiadas cuyo origen se libera al confirmar.
    pending_release: Vec<Box<dyn PendingUpload>>,
}

struct PlannedChange {
    index: usize,
    final_value: AttributeValue,
    deletions: Vec<PathBuf>,
    uploads: Vec<Box<dyn PendingUpload>>,
}

#[derive(Debug)]
pub struct ElasticAttributeStore {
    config: ElasticConfig,
    resolver: SchemaTemplateResolver,
    schema: Option<Arc<SchemaTemplateSpec>>,
    values: HashMap<String, AttributeValue>,
    files: Vec<FileAttributeState>,
    path_parameters: Option<PathParameters>,
    errors: ErrorSet,
    state: StoreState,
}

impl ElasticAttributeStore {
    pub fn new(config: &ElasticConfig, source: TemplateSource) -> Self {
        let resolver = SchemaTemplateResolver::new(source).with_except_scenarios(config.except_scenarios.clone());
        Self {
            config: config.clone(),
            resolver,
            schema: None,
            values: HashMap::new(),
            files: Vec::new(),
            path_parameters: None,
            errors: ErrorSet::new(),
            state: StoreState::Unconfigured,
        }
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    /// Resuelve la plantilla y prepara nombres, valores por defecto y
    /// atributos con ficheros. No hace nada si ya estaba configurado.
    pub fn configure(&mut self) -> Result<()> {
        if self.state != StoreState::Unconfigured {
            return Ok(());
        }
        let schema = self.resolver.resolve()?;

        self.values = schema
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.default.clone()))
            .collect();
        self.files = schema
            .file_attributes()
            .map(|(name, declaration)| FileAttributeState {
                attribute: name.to_string(),
                declaration: declaration.clone(),
                original_values: Vec::new(),
                pending_deletions: Vec::new(),
                pending_release: Vec::new(),
            })
            .collect();

        info!(
            "Modelo elástico configurado: {} atributos, {} con ficheros",
            schema.len(),
            self.files.len()
        );
        self.schema = Some(schema);
        self.state = StoreState::Configured;
        Ok(())
    }

    /// Descarta nombres, reglas y valores y vuelve a resolver la plantilla.
    pub fn reconfigure(&mut self) -> Result<()> {
        self.resolver.invalidate();
        self.schema = None;
        self.values.clear();
        self.files.clear();
        self.path_parameters = None;
        self.errors.clear();
        self.state = StoreState::Unconfigured;
        debug!("Reconfigurando el modelo elástico");
        self.configure()
    }

    /// Cambia los parámetros de la plantilla calculada. Hace falta
    /// `reconfigure` para que surtan efecto sobre un esquema ya resuelto.
    pub fn set_template_parameters(&mut self, parameters: Vec<Value>) {
        self.resolver.set_parameters(parameters);
    }

    pub fn scenario<'h>(&self, host: &'h dyn RecordHost) -> &'h str {
        host.scenario()
    }

    pub fn set_scenario(&mut self, _scenario: &str) -> Result<()> {
        Err(ElasticError::ScenarioMutation)
    }

    pub fn schema(&self) -> Option<&SchemaTemplateSpec> {
        self.schema.as_deref()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.schema.iter().flat_map(|s| s.names())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.schema.as_ref().is_some_and(|s| s.contains(name))
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.schema.as_ref()?.get(name).map(|a| a.label.as_str())
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> + '_ {
        self.schema.iter().flat_map(|s| s.rules())
    }

    /// `None` si el atributo no pertenece al esquema.
    pub fn get_attribute(&self, name: &str) -> Option<&AttributeValue> {
        if !self.has_attribute(name) {
            return None;
        }
        Some(self.values.get(name).unwrap_or(&NULL))
    }

    /// `false` (y sin cambios) si el atributo no pertenece al esquema.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<AttributeValue>) -> bool {
        if !self.has_attribute(name) {
            return false;
        }
        self.values.insert(name.to_string(), value.into());
        true
    }

    pub fn unset_attribute(&mut self, name: &str) -> bool {
        self.set_attribute(name, AttributeValue::Null)
    }

    /// Asignación masiva; las claves desconocidas se descartan en silencio.
    pub fn set_attributes<I>(&mut self, values: I) -> usize
    where
        I: IntoIterator<Item = (String, AttributeValue)>,
    {
        let mut assigned = 0;
        for (name, value) in values {
            if self.set_attribute(&name, value) {
                assigned += 1;
            }
        }
        assigned
    }

    /// Asignación masiva limitada a los atributos seguros del escenario.
    pub fn set_safe_attributes<I>(&mut self, values: I, scenario: &str) -> usize
    where
        I: IntoIterator<Item = (String, AttributeValue)>,
    {
        let Some(schema) = self.schema.clone() else {
            return 0;
        };
        let safe = safe_attribute_names(&schema, scenario);
        self.set_attributes(values.into_iter().filter(|(name, _)| safe.contains(name)))
    }

    /// Quita las claves propias del esquema para que el anfitrión no intente
    /// asignarlas por su cuenta.
    pub fn filter_out_known_attributes<V>(&self, values: HashMap<String, V>) -> HashMap<String, V> {
        values
            .into_iter()
            .filter(|(name, _)| !self.has_attribute(name))
            .collect()
    }

    /// Pares nombre/valor en el orden de la plantilla.
    pub fn attributes(&self) -> Vec<(&str, &AttributeValue)> {
        self.attribute_names()
            .map(|name| (name, self.values.get(name).unwrap_or(&NULL)))
            .collect()
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.get_attribute(name).is_some_and(|v| !v.is_empty())
    }

    /// Valor como texto, con las imágenes incrustadas ya reescritas.
    pub fn prop(&self, name: &str, renderer: &dyn ImageRenderer) -> Option<String> {
        let raw = self.get_attribute(name)?.to_string();
        Some(expand_images(&raw, |store, index| self.prop_cell(store, index), renderer))
    }

    /// Referencia `index` de un atributo con varios valores.
    pub fn prop_cell(&self, name: &str, index: usize) -> Option<String> {
        let value = self.get_attribute(name)?;
        let as_string = self.declaration(name).map(|d| d.as_string).unwrap_or(true);
        file_list(value, as_string).into_iter().nth(index)
    }

    fn declaration(&self, name: &str) -> Option<&FileDeclaration> {
        self.files
            .iter()
            .find(|f| f.attribute == name)
            .map(|f| &f.declaration)
    }

    /// Decodifica el blob almacenado. Las claves ausentes toman su valor por
    /// defecto y las desconocidas se descartan. Devuelve cuántas se asignaron.
    pub fn load(&mut self, blob: &str) -> Result<usize> {
        self.configure()?;
        let Some(schema) = self.schema.clone() else {
            return Ok(0);
        };

        self.values = schema
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.default.clone()))
            .collect();
        if blob.trim().is_empty() {
            self.state = StoreState::Loaded;
            return Ok(0);
        }

        let decoded: Map<String, Value> = serde_json::from_str(blob)?;
        let mut assigned = 0;
        for (name, raw) in decoded {
            if !schema.contains(&name) {
                debug!("Clave '{name}' fuera del esquema, se descarta");
                continue;
            }
            match AttributeValue::from_json(raw) {
                Some(value) => {
                    self.values.insert(name, value);
                    assigned += 1;
                }
                None => warn!("Valor almacenado de '{name}' no decodificable, se usa el valor por defecto"),
            }
        }
        self.state = StoreState::Loaded;
        Ok(assigned)
    }

    /// Objeto JSON con los atributos del esquema, en orden de plantilla.
    pub fn serialize(&self) -> Result<String> {
        let mut encoded = Map::new();
        for (name, value) in self.attributes() {
            encoded.insert(name.to_string(), serde_json::to_value(value)?);
        }
        Ok(serde_json::to_string(&Value::Object(encoded))?)
    }

    /// Ejecuta las reglas del escenario. Los errores quedan en `errors()`.
    pub fn validate(&mut self, scenario: &str, uploads: &dyn UploadSource) -> bool {
        let Some(schema) = self.schema.clone() else {
            return true;
        };
        self.errors = run_rules(&schema, &mut self.values, scenario, uploads);
        if !self.errors.is_empty() {
            debug!("Validación elástica con {} errores", self.errors.len());
        }
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &ErrorSet {
        &self.errors
    }

    /// Valida y vuelca los errores en el anfitrión. Nunca bloquea: devuelve
    /// siempre `true`.
    pub fn before_validate(&mut self, host: &mut dyn RecordHost, uploads: &dyn UploadSource) -> bool {
        if let Err(err) = self.configure() {
            warn!("No se pudo configurar el modelo elástico antes de validar: {err}");
            return true;
        }
        let scenario = host.scenario().to_string();
        if !self.validate(&scenario, uploads) {
            for (attribute, message) in self.errors.iter() {
                host.add_error(attribute, message);
            }
        }
        true
    }

    /// Registro existente: coloca los ficheros y escribe el blob. Registro
    /// nuevo: escribe el blob tal cual y deja los ficheros para `after_save`.
    pub fn before_save(&mut self, host: &mut dyn RecordHost, uploads: &dyn UploadSource) -> Result<()> {
        self.configure()?;
        if host.is_new_record() {
            self.state = StoreState::New;
        } else {
            self.reconcile_files(host, uploads)?;
        }
        let blob = self.serialize()?;
        host.set_column(&self.config.storage_column, blob);
        Ok(())
    }

    /// Confirma el guardado: borra los ficheros huérfanos. En registros
    /// nuevos antes coloca las subidas y reescribe la columna.
    pub fn after_save(&mut self, host: &mut dyn RecordHost, uploads: &dyn UploadSource) -> Result<SaveOutcome> {
        let mut outcome = SaveOutcome::Saved;
        if self.state == StoreState::New {
            // la clave primaria ya existe: los marcadores de ruta cambian
            self.path_parameters = None;
            if !self.files.is_empty() {
                self.reconcile_files(host, uploads)?;
                let blob = self.serialize()?;
                host.set_column(&self.config.storage_column, blob);
                outcome = SaveOutcome::ResaveRequired;
            }
        }
        self.commit();
        self.state = StoreState::Loaded;
        Ok(outcome)
    }

    /// Carga el blob de la columna; un blob ilegible se registra y se ignora.
    pub fn after_find(&mut self, host: &dyn RecordHost) -> Result<()> {
        self.configure()?;
        let blob = host.column(&self.config.storage_column).unwrap_or_default();
        if let Err(err) = self.load(&blob) {
            warn!("Blob elástico ilegible, se usan valores por defecto: {err}");
        }
        self.capture_original_values();
        self.state = StoreState::Loaded;
        Ok(())
    }

    /// Borra del disco los ficheros guardados del registro. Sólo cuentan
    /// los valores leídos o confirmados, no los editados sin guardar.
    pub fn after_delete(&mut self, host: &dyn RecordHost) -> Result<usize> {
        self.configure()?;
        let params = self.path_parameters(host).clone();
        let mut paths = Vec::new();
        for state in &self.files {
            let target = FileTarget::resolve(&state.declaration, &self.config.web_root, &params);
            let reconciler = FileAttachmentReconciler::new(state.attribute.as_str(), target);
            paths.extend(reconciler.deletion_paths(&state.original_values));
        }
        let deleted = delete_files(&paths);
        info!("Registro borrado: {deleted} ficheros eliminados");
        Ok(deleted)
    }

    /// Ruta en disco y URL, ya expandidas, de un atributo con ficheros.
    pub fn resource_path(&mut self, host: &dyn RecordHost, attribute: &str) -> Option<(PathBuf, String)> {
        let declaration = self.declaration(attribute)?.clone();
        let params = self.path_parameters(host).clone();
        let target = FileTarget::resolve(&declaration, &self.config.web_root, &params);
        Some((target.target_path, target.target_url))
    }

    /// Se calculan una vez por registro a partir de sus columnas.
    fn path_parameters(&mut self, host: &dyn RecordHost) -> &PathParameters {
        let config = &self.config;
        self.path_parameters.get_or_insert_with(|| {
            PathParameters::new(
                config
                    .path_parameters
                    .iter()
                    .map(|(placeholder, column)| (placeholder.clone(), host.column(column).unwrap_or_default()))
                    .collect(),
            )
        })
    }

    /// Reconcilia todos los atributos con ficheros. Si alguno falla se
    /// deshacen los ficheros ya colocados y los valores no cambian.
    fn reconcile_files(&mut self, host: &dyn RecordHost, uploads: &dyn UploadSource) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        let params = self.path_parameters(host).clone();

        let mut placed: Vec<(FileAttachmentReconciler, Vec<PathBuf>)> = Vec::new();
        let mut changes = Vec::with_capacity(self.files.len());
        for (index, state) in self.files.iter().enumerate() {
            let target = FileTarget::resolve(&state.declaration, &self.config.web_root, &params);
            let reconciler = FileAttachmentReconciler::new(state.attribute.as_str(), target);
            let submitted = self.values.get(&state.attribute).unwrap_or(&NULL);

            let result = uploads
                .pending_uploads(&state.attribute, &file_list(submitted, state.declaration.as_string))
                .and_then(|pending| {
                    reconciler
                        .reconcile(&state.original_values, submitted, &pending)
                        .map(|reconciliation| (reconciliation, pending))
                });
            match result {
                Ok((reconciliation, pending)) => {
                    changes.push(PlannedChange {
                        index,
                        final_value: reconciliation.final_value,
                        deletions: reconciler.deletion_paths(&reconciliation.to_delete),
                        uploads: pending,
                    });
                    placed.push((reconciler, reconciliation.persisted));
                }
                Err(err) => {
                    for (earlier, files) in &placed {
                        earlier.rollback(files);
                    }
                    return Err(err);
                }
            }
        }

        for change in changes {
            let state = &mut self.files[change.index];
            state.pending_deletions = change.deletions;
            state.pending_release.extend(change.uploads);
            self.values.insert(state.attribute.clone(), change.final_value);
        }
        Ok(())
    }

    fn commit(&mut self) {
        let mut deleted = 0;
        for state in &mut self.files {
            deleted += delete_files(&state.pending_deletions);
            state.pending_deletions.clear();
            release_uploads(&state.pending_release);
            state.pending_release.clear();
        }
        if deleted > 0 {
            info!("Guardado confirmado: {deleted} ficheros huérfanos borrados");
        }
        self.capture_original_values();
    }

    fn capture_original_values(&mut self) {
        for state in &mut self.files {
            let current = self.values.get(&state.attribute).unwrap_or(&NULL);
            state.original_values = file_list(current, state.declaration.as_string);
        }
    }
}
