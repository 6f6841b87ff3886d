//! Taxonomía de errores de la librería y conjunto de errores de validación.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ElasticError>;

#[derive(Debug, thiserror::Error)]
pub enum ElasticError {
    /// La plantilla no es un objeto (ni lo produce la función de origen).
    #[error("Plantilla no válida: {0}")]
    SchemaResolution(String),

    /// El escenario pertenece al registro anfitrión; el almacén sólo lo lee.
    #[error("El escenario no puede fijarse directamente en el modelo elástico")]
    ScenarioMutation,

    #[error("No se pudo colocar el fichero '{name}' en {}: {source}", destination.display())]
    FileUpload {
        name: String,
        destination: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Un atributo de fichero único terminaría con varias referencias.
    #[error("El atributo '{attribute}' admite un solo fichero pero quedan {count}")]
    AmbiguousSingleValue { attribute: String, count: usize },

    #[error("Nombre no válido: {0}")]
    InvalidName(String),

    #[error("Error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

/// Errores de validación por atributo. Nunca se lanzan: se acumulan y se
/// vuelcan en el registro anfitrión.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSet(BTreeMap<String, Vec<String>>);

impl ErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, attribute: &str, message: impl Into<String>) {
        self.0
            .entry(attribute.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn get(&self, attribute: &str) -> &[String] {
        self.0.get(attribute).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, attribute: &str) -> bool {
        self.0.contains_key(attribute)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Número total de mensajes.
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(attr, msgs)| msgs.iter().map(move |m| (attr.as_str(), m.as_str())))
    }
}
