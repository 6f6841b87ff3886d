//! Atributos elásticos para registros persistidos en una sola columna.
//!
//! Un registro anfitrión declara, mediante una plantilla (estática o
//! calculada), un conjunto dinámico de atributos con reglas, etiquetas y
//! valores por defecto. Los atributos que llevan ficheros adjuntos se
//! reconcilian en cada guardado: se colocan las subidas nuevas, se renombran
//! en caso de colisión y se borran los ficheros huérfanos tras un guardado
//! correcto.

// Módulos de la librería
pub mod api;
pub mod app_state;
pub mod config;
pub mod content;
pub mod errors;
pub mod models;
pub mod params;
pub mod schema;
pub mod staging;
pub mod store;
pub mod uploads;
pub mod validation;

pub use config::{AppConfig, ElasticConfig};
pub use content::{ImageRenderer, UrlImageRenderer};
pub use errors::{ElasticError, ErrorSet, Result};
pub use models::{
    AttributeSpec, AttributeValue, FileCardinality, FileDeclaration, Rule, SchemaTemplateSpec,
    TEMP_MARKER,
};
pub use params::{MemoryCache, ParameterCache, ParameterSource, Parameters};
pub use schema::{derive_label, SchemaTemplateResolver, TemplateSource};
pub use staging::{StagedFile, TempUploadArea};
pub use store::{ElasticAttributeStore, RecordHost, SaveOutcome, StoreState};
pub use uploads::{
    FileAttachmentReconciler, FileTarget, NoUploads, PathParameters, PendingUpload,
    Reconciliation, UploadSource,
};
