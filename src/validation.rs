//! Evaluación de reglas sobre los valores de los atributos elásticos.
//!
//! Los fallos nunca se lanzan: se acumulan en un `ErrorSet` con mensajes que
//! usan la etiqueta del atributo.

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

use crate::{
    errors::ErrorSet,
    models::{AttributeValue, Rule, SchemaTemplateSpec},
    schema::truthy,
    uploads::{file_list, UploadSource},
};

/// Ejecuta las reglas activas en `scenario`. La regla `default` puede
/// rellenar valores vacíos, por eso recibe los valores mutables.
pub fn run_rules(
    schema: &SchemaTemplateSpec,
    values: &mut HashMap<String, AttributeValue>,
    scenario: &str,
    uploads: &dyn UploadSource,
) -> ErrorSet {
    let mut errors = ErrorSet::new();
    for rule in schema.rules().filter(|r| r.applies_to(scenario)) {
        for attribute in &rule.attributes {
            let Some(declared) = schema.get(attribute) else {
                continue;
            };
            let label = declared.label.as_str();

            if rule.kind == "default" {
                apply_default(rule, values, attribute);
                continue;
            }

            let value = values.get(attribute).cloned().unwrap_or_default();
            let outcome = match rule.kind.as_str() {
                "required" => check_required(label, &value),
                "file" => check_files(rule, label, attribute, &value, declared.file.as_ref().map(|f| f.as_string), uploads),
                "safe" | "unsafe" => None,
                _ if value.is_empty() && allow_empty(&rule.params) => None,
                "length" => check_length(&rule.params, label, &value),
                "numerical" => check_numerical(&rule.params, label, &value),
                "boolean" => check_boolean(label, &value),
                "in" => check_in(&rule.params, label, &value),
                "match" => check_match(&rule.params, label, &value),
                "email" => check_email(label, &value),
                "url" => check_url(label, &value),
                other => {
                    warn!("Tipo de regla desconocido '{other}' en '{attribute}', se ignora");
                    None
                }
            };
            if let Some(message) = outcome {
                errors.add(attribute, message);
            }
        }
    }
    errors
}

/// Atributos asignables de forma masiva en `scenario`: los que tienen alguna
/// regla activa distinta de `unsafe`.
pub fn safe_attribute_names(schema: &SchemaTemplateSpec, scenario: &str) -> Vec<String> {
    let mut safe: Vec<String> = Vec::new();
    let mut unsafe_names: Vec<&str> = Vec::new();
    for rule in schema.rules().filter(|r| r.applies_to(scenario)) {
        for attribute in &rule.attributes {
            if rule.kind == "unsafe" {
                unsafe_names.push(attribute);
            } else if !safe.contains(attribute) {
                safe.push(attribute.clone());
            }
        }
    }
    safe.retain(|name| !unsafe_names.contains(&name.as_str()));
    safe
}

fn apply_default(rule: &Rule, values: &mut HashMap<String, AttributeValue>, attribute: &str) {
    let set_on_empty = rule.params.get("setOnEmpty").map(truthy).unwrap_or(true);
    let current_empty = values.get(attribute).map(AttributeValue::is_empty).unwrap_or(true);
    if set_on_empty && !current_empty {
        return;
    }
    let default = rule
        .params
        .get("value")
        .cloned()
        .and_then(AttributeValue::from_json)
        .unwrap_or_default();
    values.insert(attribute.to_string(), default);
}

fn allow_empty(params: &Map<String, Value>) -> bool {
    params.get("allowEmpty").map(truthy).unwrap_or(true)
}

fn check_required(label: &str, value: &AttributeValue) -> Option<String> {
    let blank = match value {
        AttributeValue::Text(text) => text.trim().is_empty(),
        other => other.is_empty(),
    };
    blank.then(|| format!("{label} no puede estar vacío."))
}

fn check_length(params: &Map<String, Value>, label: &str, value: &AttributeValue) -> Option<String> {
    let length = value.to_string().chars().count() as u64;
    if let Some(min) = params.get("min").and_then(Value::as_u64) {
        if length < min {
            return Some(format!("{label} es demasiado corto (mínimo {min} caracteres)."));
        }
    }
    if let Some(max) = params.get("max").and_then(Value::as_u64) {
        if length > max {
            return Some(format!("{label} es demasiado largo (máximo {max} caracteres)."));
        }
    }
    if let Some(is) = params.get("is").and_then(Value::as_u64) {
        if length != is {
            return Some(format!("{label} debe tener exactamente {is} caracteres."));
        }
    }
    None
}

fn check_numerical(params: &Map<String, Value>, label: &str, value: &AttributeValue) -> Option<String> {
    let text = value.to_string();
    let text = text.trim();
    let integer_only = params.get("integerOnly").map(truthy).unwrap_or(false);

    let number = if integer_only {
        match text.parse::<i64>() {
            Ok(n) => n as f64,
            Err(_) => return Some(format!("{label} debe ser un número entero.")),
        }
    } else {
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => n,
            _ => return Some(format!("{label} debe ser un número.")),
        }
    };

    if let Some(min) = params.get("min").and_then(Value::as_f64) {
        if number < min {
            return Some(format!("{label} es demasiado pequeño (mínimo {min})."));
        }
    }
    if let Some(max) = params.get("max").and_then(Value::as_f64) {
        if number > max {
            return Some(format!("{label} es demasiado grande (máximo {max})."));
        }
    }
    None
}

fn check_boolean(label: &str, value: &AttributeValue) -> Option<String> {
    let valid = match value {
        AttributeValue::Bool(_) => true,
        AttributeValue::Integer(n) => *n == 0 || *n == 1,
        AttributeValue::Text(text) => text == "0" || text == "1",
        _ => false,
    };
    (!valid).then(|| format!("{label} debe ser 1 o 0."))
}

fn check_in(params: &Map<String, Value>, label: &str, value: &AttributeValue) -> Option<String> {
    let Some(range) = params.get("range").and_then(Value::as_array) else {
        warn!("Regla 'in' sin 'range' para {label}");
        return None;
    };
    let current = value.to_string();
    let found = range.iter().any(|candidate| match candidate {
        Value::String(s) => *s == current,
        other => other.to_string() == current,
    });
    (!found).then(|| format!("{label} no está en la lista de valores permitidos."))
}

fn check_match(params: &Map<String, Value>, label: &str, value: &AttributeValue) -> Option<String> {
    let Some(pattern) = params.get("pattern").and_then(Value::as_str) else {
        warn!("Regla 'match' sin 'pattern' para {label}");
        return None;
    };
    let regex = match compile_pattern(pattern) {
        Ok(regex) => regex,
        Err(err) => {
            warn!("Patrón no válido para {label}: {err}");
            return None;
        }
    };
    let negate = params.get("not").map(truthy).unwrap_or(false);
    let matched = regex.is_match(&value.to_string());
    (matched == negate).then(|| format!("{label} no es válido."))
}

/// Admite patrones con delimitadores (`/^[a-z]+$/i`) o expresiones sueltas.
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(rest) = pattern.strip_prefix('/') {
        if let Some(end) = rest.rfind('/') {
            let (body, flags) = (&rest[..end], &rest[end + 1..]);
            return RegexBuilder::new(body)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .dot_matches_new_line(flags.contains('s'))
                .build();
        }
    }
    Regex::new(pattern)
}

fn check_email(label: &str, value: &AttributeValue) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-zA-Z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?\.)+[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?$",
        )
        .expect("regex válida")
    });
    (!re.is_match(&value.to_string())).then(|| format!("{label} no es una dirección de correo válida."))
}

fn check_url(label: &str, value: &AttributeValue) -> Option<String> {
    let valid = url::Url::parse(&value.to_string())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false);
    (!valid).then(|| format!("{label} no es una URL válida."))
}

/// Número de ficheros y tamaño/tipo de las subidas pendientes.
fn check_files(
    rule: &Rule,
    label: &str,
    attribute: &str,
    value: &AttributeValue,
    as_string: Option<bool>,
    uploads: &dyn UploadSource,
) -> Option<String> {
    let params = &rule.params;
    let files = file_list(value, as_string.unwrap_or(false));
    let pending = uploads.pending_uploads(attribute, &files).unwrap_or_else(|err| {
        warn!("No se pudieron leer las subidas de '{attribute}': {err}");
        Vec::new()
    });

    if files.is_empty() && pending.is_empty() {
        return (!allow_empty(params)).then(|| format!("{label} no puede estar vacío."));
    }

    let max_files = params.get("maxFiles").and_then(Value::as_u64).unwrap_or(1);
    if files.len().max(pending.len()) as u64 > max_files {
        return Some(format!("{label} no admite más de {max_files} ficheros."));
    }

    let types: Option<Vec<String>> = params.get("types").map(|t| match t {
        Value::String(s) => s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|x| !x.is_empty())
            .map(str::to_lowercase)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect(),
        _ => Vec::new(),
    });

    for upload in &pending {
        let name = upload.original_name();
        if let Some(max) = params.get("maxSize").and_then(Value::as_u64) {
            if upload.size() > max {
                return Some(format!("El fichero \"{name}\" es demasiado grande (máximo {max} bytes)."));
            }
        }
        if let Some(min) = params.get("minSize").and_then(Value::as_u64) {
            if upload.size() < min {
                return Some(format!("El fichero \"{name}\" es demasiado pequeño (mínimo {min} bytes)."));
            }
        }
        if let Some(types) = &types {
            let extension = std::path::Path::new(name)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !types.contains(&extension) {
                return Some(format!(
                    "El fichero \"{name}\" no se puede subir. Sólo se admiten: {}.",
                    types.join(", ")
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::parse_template,
        uploads::{NoUploads, PendingUpload},
    };
    use serde_json::json;
    use std::path::Path;

    fn values(pairs: &[(&str, AttributeValue)]) -> HashMap<String, AttributeValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn required_and_length_use_labels() {
        let schema = parse_template(
            &json!({"title": {"model": {"rules": [["required"], ["length", {"min": 3}]], "label": "Título"}}}),
            None,
        )
        .unwrap();

        let mut empty = values(&[("title", AttributeValue::from(""))]);
        let errors = run_rules(&schema, &mut empty, "insert", &NoUploads);
        assert_eq!(errors.get("title"), ["Título no puede estar vacío.".to_string()]);

        let mut short = values(&[("title", AttributeValue::from("ab"))]);
        let errors = run_rules(&schema, &mut short, "insert", &NoUploads);
        assert_eq!(errors.len(), 1);
        assert!(errors.get("title")[0].contains("demasiado corto"));
    }

    #[test]
    fn empty_values_skip_non_required_rules() {
        let schema = parse_template(
            &json!({
                "age": {"model": {"rules": [["numerical", {"integerOnly": true, "min": 18}]]}},
                "mail": {"model": {"rules": [["email", {"allowEmpty": false}]]}}
            }),
            None,
        )
        .unwrap();
        let mut current = values(&[("age", AttributeValue::Null), ("mail", AttributeValue::Null)]);
        let errors = run_rules(&schema, &mut current, "insert", &NoUploads);
        assert!(!errors.has("age"));
        assert!(errors.has("mail"));
    }

    #[test]
    fn numerical_in_match_email_url() {
        let schema = parse_template(
            &json!({
                "age": {"model": {"rules": [["numerical", {"integerOnly": true, "max": 120}]]}},
                "color": {"model": {"rules": [["in", {"range": ["red", "blue"]}]]}},
                "code": {"model": {"rules": [["match", {"pattern": "/^[A-Z]{3}$/"}]]}},
                "mail": {"model": {"rules": [["email"]]}},
                "site": {"model": {"rules": [["url"]]}}
            }),
            None,
        )
        .unwrap();

        let mut good = values(&[
            ("age", AttributeValue::from(42)),
            ("color", AttributeValue::from("red")),
            ("code", AttributeValue::from("ABC")),
            ("mail", AttributeValue::from("ana@example.com")),
            ("site", AttributeValue::from("https://example.com/x")),
        ]);
        assert!(run_rules(&schema, &mut good, "insert", &NoUploads).is_empty());

        let mut bad = values(&[
            ("age", AttributeValue::from("4.5")),
            ("color", AttributeValue::from("green")),
            ("code", AttributeValue::from("abc")),
            ("mail", AttributeValue::from("ana@")),
            ("site", AttributeValue::from("ftp//nope")),
        ]);
        let errors = run_rules(&schema, &mut bad, "insert", &NoUploads);
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn rules_respect_except_scenarios() {
        let schema = parse_template(
            &json!({"title": {"model": {"rules": [["required"]]}}}),
            Some("search"),
        )
        .unwrap();
        let mut current = values(&[("title", AttributeValue::Null)]);
        assert!(run_rules(&schema, &mut current, "search", &NoUploads).is_empty());
        assert!(!run_rules(&schema, &mut current, "insert", &NoUploads).is_empty());
    }

    #[test]
    fn default_rule_fills_empty_values() {
        let schema = parse_template(
            &json!({"status": {"model": {"rules": [["default", {"value": "draft"}]]}}}),
            None,
        )
        .unwrap();
        let mut current = values(&[("status", AttributeValue::Null)]);
        run_rules(&schema, &mut current, "insert", &NoUploads);
        assert_eq!(current["status"], AttributeValue::from("draft"));
    }

    #[test]
    fn safe_names_exclude_unsafe_rules() {
        let schema = parse_template(
            &json!({
                "title": {"model": {"rules": [["safe"]]}},
                "secret": {"model": {"rules": [["length", {"max": 3}], ["unsafe"]]}},
                "bare": {"model": {}}
            }),
            None,
        )
        .unwrap();
        assert_eq!(safe_attribute_names(&schema, "update"), vec!["title".to_string()]);
    }

    #[derive(Debug)]
    struct FakeUpload(&'static str, u64);

    impl PendingUpload for FakeUpload {
        fn original_name(&self) -> &str {
            self.0
        }
        fn size(&self) -> u64 {
            self.1
        }
        fn save_to(&self, _: &Path) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FakeSource;

    impl UploadSource for FakeSource {
        fn pending_uploads(&self, _: &str, _: &[String]) -> crate::Result<Vec<Box<dyn PendingUpload>>> {
            Ok(vec![Box::new(FakeUpload("big.exe", 5000))])
        }
    }

    #[test]
    fn file_rule_checks_pending_uploads() {
        let schema = parse_template(
            &json!({"photo": {
                "model": {"rules": [["file", {"types": "jpg, png", "maxSize": 1000}]]},
                "element": {"type": "asyncfile"}
            }}),
            None,
        )
        .unwrap();
        let mut current = values(&[("photo", AttributeValue::from("tmp://big.exe"))]);
        let errors = run_rules(&schema, &mut current, "insert", &FakeSource);
        assert!(errors.get("photo")[0].contains("demasiado grande"));

        let mut none = values(&[("photo", AttributeValue::Null)]);
        assert!(run_rules(&schema, &mut none, "insert", &NoUploads).is_empty());
    }

    #[test]
    fn file_rule_limits_file_count() {
        let schema = parse_template(
            &json!({"gallery": {
                "model": {"rules": [["file", {"maxFiles": 2}]]},
                "element": {"type": "asyncfile", "config": {"multiSelection": true}}
            }}),
            None,
        )
        .unwrap();
        let mut current = values(&[("gallery", AttributeValue::from(vec!["a.png", "b.png", "c.png"]))]);
        let errors = run_rules(&schema, &mut current, "update", &NoUploads);
        assert_eq!(errors.get("gallery"), ["Gallery no admite más de 2 ficheros.".to_string()]);
    }
}
