//! Parámetros jerárquicos de sólo lectura.
//!
//! Las filas planas `("menu.items.home", "Inicio")` se convierten en un árbol
//! JSON. Se consultan con rutas con puntos, donde un segmento vacío equivale
//! al índice 0. Los parámetros estáticos de la aplicación se aplican encima.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::Result;

/// Filas `(clave, valor)` de la tabla de parámetros.
pub trait ParameterSource {
    fn rows(&self) -> Result<Vec<(String, String)>>;
}

impl ParameterSource for Vec<(String, String)> {
    fn rows(&self) -> Result<Vec<(String, String)>> {
        Ok(self.clone())
    }
}

/// Caché clave/valor con caducidad opcional.
pub trait ParameterCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Value, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value, expires));
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    root: Value,
}

impl Parameters {
    pub const CACHE_KEY: &'static str = "elastic_model.parameters";

    /// Construye el árbol. Las filas se aplican ordenadas por valor; una ruta
    /// que ya tiene valor pasa a ser una lista con todos ellos.
    pub fn from_rows(mut rows: Vec<(String, String)>) -> Self {
        rows.sort_by(|a, b| a.1.cmp(&b.1));
        let mut root = Value::Object(Map::new());
        for (key, value) in rows {
            insert_path(&mut root, &key, value);
        }
        Self { root }
    }

    /// Carga desde la caché si está disponible; si no, desde el origen, y
    /// guarda el resultado. Los parámetros estáticos se aplican al final.
    pub fn load(
        source: &dyn ParameterSource,
        statics: Option<&Value>,
        cache: Option<&dyn ParameterCache>,
        ttl: Option<Duration>,
    ) -> Result<Self> {
        let cached = cache.and_then(|c| c.get(Self::CACHE_KEY));
        let mut parameters = match cached {
            Some(root) => {
                debug!("Parámetros leídos de la caché");
                Self { root }
            }
            None => {
                let parameters = Self::from_rows(source.rows()?);
                if let Some(cache) = cache {
                    cache.set(Self::CACHE_KEY, parameters.root.clone(), ttl);
                }
                parameters
            }
        };
        if let Some(statics) = statics {
            merge(&mut parameters.root, statics);
        }
        Ok(parameters)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.root, |node, segment| match node {
            Value::Array(items) => items.get(index_of(segment)?),
            Value::Object(map) if segment.is_empty() => map.get("0").or_else(|| map.values().next()),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

fn index_of(segment: &str) -> Option<usize> {
    if segment.is_empty() {
        Some(0)
    } else {
        segment.parse().ok()
    }
}

fn insert_path(root: &mut Value, key: &str, value: String) {
    let segments: Vec<&str> = key.split('.').collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let Value::Object(map) = node else {
            warn!("Parámetro '{key}' ignorado: '{segment}' ya tiene un valor simple");
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let Value::Object(map) = node else {
        warn!("Parámetro '{key}' ignorado: el nodo padre tiene un valor simple");
        return;
    };
    match map.get_mut(*leaf) {
        None => {
            map.insert(leaf.to_string(), Value::String(value));
        }
        Some(Value::Array(items)) => items.push(Value::String(value)),
        Some(Value::Object(children)) => {
            let next = children.len().to_string();
            children.insert(next, Value::String(value));
        }
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, Value::String(value)]);
        }
    }
}

/// Fusión profunda: los valores de `overlay` ganan.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
