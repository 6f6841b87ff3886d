//! Modelos de dominio: valores de atributos elásticos, reglas de validación
//! y declaraciones de ficheros adjuntos resueltas desde una plantilla.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Prefijo reservado para ficheros subidos que aún no se han confirmado.
pub const TEMP_MARKER: &str = "tmp://";

/// Valor de un atributo elástico.
///
/// Se serializa sin etiqueta, así el blob almacenado es un objeto JSON plano.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl AttributeValue {
    /// Vacío: nulo, texto vacío o lista vacía.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(text) => text.is_empty(),
            Self::List(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convierte un valor JSON arbitrario; `None` si no encaja en ninguna forma.
    pub fn from_json(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(true) => f.write_str("1"),
            Self::Bool(false) => f.write_str("0"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Text(text) => f.write_str(text),
            Self::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_string).collect())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Regla de validación ya expandida para un atributo concreto.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    /// Primer elemento posicional: los atributos a los que aplica.
    pub attributes: Vec<String>,
    pub kind: String,
    pub params: Map<String, Value>,
    /// Escenarios excluidos, separados por comas.
    pub except: Option<String>,
    /// Escenarios a los que se limita la regla, separados por comas.
    pub on: Option<String>,
}

impl Rule {
    /// Indica si la regla está activa en `scenario`.
    pub fn applies_to(&self, scenario: &str) -> bool {
        if let Some(except) = &self.except {
            if split_scenarios(except).any(|s| s == scenario) {
                return false;
            }
        }
        match &self.on {
            Some(on) => split_scenarios(on).any(|s| s == scenario),
            None => true,
        }
    }
}

fn split_scenarios(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Cardinalidad de un atributo con ficheros, fijada al resolver la plantilla.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileCardinality {
    Single,
    Multiple,
}

/// Declaración de fichero adjunto tal como aparece en la plantilla.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDeclaration {
    pub cardinality: FileCardinality,
    pub as_string: bool,
    /// Plantilla de ruta en disco; `None` equivale a la raíz web.
    pub target_path_alias: Option<String>,
    /// Plantilla de URL normalizada: sin barra inicial y con barra final.
    pub target_url: String,
}

/// Atributo resuelto desde la plantilla.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeSpec {
    pub name: String,
    pub rules: Vec<Rule>,
    pub label: String,
    pub default: AttributeValue,
    pub file: Option<FileDeclaration>,
}

/// Esquema concreto: atributos en el orden de la plantilla de origen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaTemplateSpec {
    pub attributes: Vec<AttributeSpec>,
}

impl SchemaTemplateSpec {
    pub fn get(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.attributes.iter().flat_map(|a| a.rules.iter())
    }

    pub fn file_attributes(&self) -> impl Iterator<Item = (&str, &FileDeclaration)> {
        self.attributes
            .iter()
            .filter_map(|a| a.file.as_ref().map(|f| (a.name.as_str(), f)))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
