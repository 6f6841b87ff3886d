//! Resolución de plantillas de atributos elásticos.
//!
//! Una plantilla es un objeto JSON `atributo → {model, element}`. Puede darse
//! literal o calcularse con una función a partir de parámetros de contexto
//! (p. ej. el tipo de contenido del registro). El resultado se cachea hasta
//! que se invalida explícitamente.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    errors::{ElasticError, Result},
    models::{AttributeSpec, AttributeValue, FileCardinality, FileDeclaration, Rule, SchemaTemplateSpec},
};

/// Función que calcula una plantilla a partir de los parámetros de contexto.
pub type TemplateFn = dyn Fn(&[Value]) -> Value + Send + Sync;

/// Origen de la plantilla.
#[derive(Clone)]
pub enum TemplateSource {
    Literal(Value),
    Computed(Arc<TemplateFn>),
}

impl TemplateSource {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    pub fn empty() -> Self {
        Self::Literal(Value::Object(Map::new()))
    }
}

impl fmt::Debug for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Resuelve y cachea el esquema de un registro.
#[derive(Debug)]
pub struct SchemaTemplateResolver {
    source: TemplateSource,
    parameters: Vec<Value>,
    except_scenarios: Option<String>,
    cached: Option<Arc<SchemaTemplateSpec>>,
}

impl SchemaTemplateResolver {
    pub fn new(source: TemplateSource) -> Self {
        Self {
            source,
            parameters: Vec::new(),
            except_scenarios: None,
            cached: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Política global de escenarios excluidos, añadida a cada regla.
    pub fn with_except_scenarios(mut self, scenarios: Option<String>) -> Self {
        self.except_scenarios = scenarios;
        self
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    /// Cambia los parámetros de contexto. No invalida la caché.
    pub fn set_parameters(&mut self, parameters: Vec<Value>) {
        self.parameters = parameters;
    }

    pub fn set_source(&mut self, source: TemplateSource) {
        self.source = source;
        self.cached = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    pub fn resolve(&mut self) -> Result<Arc<SchemaTemplateSpec>> {
        if let Some(schema) = &self.cached {
            return Ok(Arc::clone(schema));
        }

        let template = match &self.source {
            TemplateSource::Literal(value) => value.clone(),
            TemplateSource::Computed(f) => f(&self.parameters),
        };
        let schema = Arc::new(parse_template(&template, self.except_scenarios.as_deref())?);
        debug!("Plantilla resuelta con {} atributos", schema.len());
        self.cached = Some(Arc::clone(&schema));
        Ok(schema)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

/// Convierte una plantilla JSON en un esquema concreto.
pub fn parse_template(template: &Value, except_scenarios: Option<&str>) -> Result<SchemaTemplateSpec> {
    let entries = template.as_object().ok_or_else(|| {
        ElasticError::SchemaResolution(format!("se esperaba un objeto, se obtuvo {}", kind_of(template)))
    })?;

    let mut attributes = Vec::with_capacity(entries.len());
    for (name, entry) in entries {
        if name == "separator" {
            continue;
        }
        let Some(model) = entry.get("model").and_then(Value::as_object) else {
            continue;
        };

        let rules = model
            .get("rules")
            .and_then(Value::as_array)
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|raw| expand_rule(name, raw, except_scenarios))
                    .collect()
            })
            .unwrap_or_default();

        let label = model
            .get("label")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| derive_label(name));

        let default = match model.get("value") {
            None | Some(Value::Null) => AttributeValue::Null,
            Some(value) => AttributeValue::from_json(value.clone()).unwrap_or_else(|| {
                warn!("Valor por defecto no soportado para '{name}', se usa nulo");
                AttributeValue::Null
            }),
        };

        attributes.push(AttributeSpec {
            name: name.clone(),
            rules,
            label,
            default,
            file: file_declaration(model, entry.get("element")),
        });
    }

    Ok(SchemaTemplateSpec { attributes })
}

fn file_declaration(model: &Map<String, Value>, element: Option<&Value>) -> Option<FileDeclaration> {
    let element = element?.as_object()?;
    if element.get("type").and_then(Value::as_str) != Some("asyncfile") {
        return None;
    }

    let multi = element
        .get("config")
        .and_then(|c| c.get("multiSelection"))
        .map(truthy)
        .unwrap_or(false);

    Some(FileDeclaration {
        cardinality: if multi { FileCardinality::Multiple } else { FileCardinality::Single },
        as_string: model.get("asString").map(truthy).unwrap_or(false),
        target_path_alias: model
            .get("targetPathAlias")
            .and_then(Value::as_str)
            .map(str::to_string),
        target_url: normalize_url(model.get("targetUrl").and_then(Value::as_str).unwrap_or("")),
    })
}

/// Sin barra inicial y con una barra final; la cadena vacía se queda vacía.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Antepone el atributo a la regla y fusiona la política de escenarios excluidos.
fn expand_rule(attribute: &str, raw: &Value, except_policy: Option<&str>) -> Option<Rule> {
    let (kind, mut params) = match raw {
        Value::Array(items) => {
            let kind = items.first()?.as_str()?.to_string();
            let mut params = Map::new();
            for extra in items.iter().skip(1) {
                if let Some(obj) = extra.as_object() {
                    params.extend(obj.clone());
                }
            }
            (kind, params)
        }
        Value::Object(obj) => {
            let mut params = obj.clone();
            let kind = params.remove("kind")?.as_str()?.to_string();
            (kind, params)
        }
        _ => {
            warn!("Regla ignorada en '{attribute}': formato no reconocido");
            return None;
        }
    };

    let own_except = params.remove("except").and_then(|v| scenario_list(&v));
    let on = params.remove("on").and_then(|v| scenario_list(&v));
    let except = match (own_except, except_policy) {
        (Some(own), Some(policy)) => Some(format!("{own},{policy}")),
        (None, Some(policy)) => Some(policy.to_string()),
        (own, None) => own,
    };

    Some(Rule {
        attributes: vec![attribute.to_string()],
        kind,
        params,
        except,
        on,
    })
}

fn scenario_list(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

/// Etiqueta legible a partir del nombre del atributo:
/// `userFirstName` → `User First Name`, `invoice-date` → `Invoice Date`.
pub fn derive_label(name: &str) -> String {
    let mut spaced = String::with_capacity(name.len() + 4);
    let mut prev_upper = false;
    for c in name.chars() {
        let upper = c.is_ascii_uppercase();
        if upper && !prev_upper {
            spaced.push(' ');
        }
        spaced.push(c);
        prev_upper = upper;
    }

    let lowered = spaced
        .replace(|c: char| matches!(c, '-' | '_' | '.'), " ")
        .to_lowercase();

    let mut label = String::with_capacity(lowered.len());
    let mut word_start = true;
    for c in lowered.trim().chars() {
        if word_start {
            label.extend(c.to_uppercase());
        } else {
            label.push(c);
        }
        word_start = c.is_whitespace();
    }
    label
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        _ => false,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "un booleano",
        Value::Number(_) => "un número",
        Value::String(_) => "una cadena",
        Value::Array(_) => "una lista",
        Value::Object(_) => "un objeto",
    }
}
