//! Carga y gestión de configuración: la del servidor (desde el entorno) y la
//! del modelo elástico (explícita, se pasa al construir cada almacén).

use std::env;
use std::path::PathBuf;
use anyhow::{anyhow, Result};

/// Configuración del modelo elástico de un tipo de registro.
#[derive(Clone, Debug, PartialEq)]
pub struct ElasticConfig {
    /// Columna del registro que guarda el blob serializado.
    pub storage_column: String,
    /// Raíz de las rutas relativas de `targetPathAlias`.
    pub web_root: PathBuf,
    /// Escenarios excluidos que se añaden a todas las reglas.
    pub except_scenarios: Option<String>,
    /// Marcador de ruta → columna del registro (`("{id}", "id")`).
    pub path_parameters: Vec<(String, String)>,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            storage_column: "elastic_storage".to_string(),
            web_root: PathBuf::from("public"),
            except_scenarios: None,
            path_parameters: Vec::new(),
        }
    }
}

/// Configuración completa del servidor.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub web_root: PathBuf,
    pub upload_temp_dir: PathBuf,
    pub preview_width: u32,
    pub preview_height: u32,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());
        let web_root = PathBuf::from(env::var("WEB_ROOT").unwrap_or_else(|_| "public".to_string()));

        let upload_temp_dir = match env::var("UPLOAD_TEMP_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::cache_dir()
                .ok_or_else(|| anyhow!("No se pudo determinar el directorio de caché del usuario; defina UPLOAD_TEMP_DIR"))?
                .join("elastic-model")
                .join("uploads"),
        };

        Ok(Self {
            server_addr,
            web_root,
            upload_temp_dir,
            preview_width: numeric_var("PREVIEW_WIDTH", 100)?,
            preview_height: numeric_var("PREVIEW_HEIGHT", 100)?,
            max_upload_bytes: numeric_var("MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
        })
    }

    /// Configuración del modelo elástico que comparte la raíz web del servidor.
    pub fn elastic(&self) -> ElasticConfig {
        ElasticConfig {
            web_root: self.web_root.clone(),
            ..ElasticConfig::default()
        }
    }
}

fn numeric_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{name} debe ser un número, se obtuvo '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elastic_defaults() {
        let config = ElasticConfig::default();
        assert_eq!(config.storage_column, "elastic_storage");
        assert_eq!(config.web_root, PathBuf::from("public"));
        assert!(config.path_parameters.is_empty());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        env::set_var("ELASTIC_TEST_NUMBER", "diez");
        assert!(numeric_var::<u32>("ELASTIC_TEST_NUMBER", 1).is_err());
        env::set_var("ELASTIC_TEST_NUMBER", " 10 ");
        assert_eq!(numeric_var::<u32>("ELASTIC_TEST_NUMBER", 1).unwrap(), 10);
        assert_eq!(numeric_var::<u32>("ELASTIC_TEST_MISSING", 7).unwrap(), 7);
    }
}
