use chrono::Duration;
use node_state::{NodeError, NodeTransitions, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuración del caché de nodos.
///
/// Se puede construir a mano, deserializar o leer del entorno con
/// `from_env` (que además carga `.env` si existe).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Segundos tras los cuales una introspección activa se considera
    /// vencida. `<= 0` desactiva `clean_up`.
    pub timeout_secs: i64,
    /// URL de la base de datos; si falta se usa la del store por defecto.
    pub database_url: Option<String>,
    /// Fichero JSON con una tabla de transiciones alternativa.
    pub transitions_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { timeout_secs: 3600,
                      database_url: None,
                      transitions_path: None }
    }
}

impl CacheConfig {
    /// Lee `INSPECTOR_TIMEOUT`, `INSPECTOR_DB_URL` (o `DATABASE_URL`) e
    /// `INSPECTOR_TRANSITIONS`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = CacheConfig::default();
        if let Ok(raw) = std::env::var("INSPECTOR_TIMEOUT") {
            config.timeout_secs =
                raw.trim()
                   .parse()
                   .map_err(|e| NodeError::error(format!("INSPECTOR_TIMEOUT inválido \"{}\": {}", raw, e)))?;
        }
        config.database_url = std::env::var("INSPECTOR_DB_URL").or_else(|_| std::env::var("DATABASE_URL")).ok();
        config.transitions_path = std::env::var("INSPECTOR_TRANSITIONS").ok().map(PathBuf::from);
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::seconds(self.timeout_secs)
    }

    /// Tabla de transiciones configurada (o la integrada si no hay fichero).
    pub fn load_transitions(&self) -> Result<NodeTransitions> {
        match &self.transitions_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                              NodeError::error(format!("no se pudo leer {}: {}", path.display(), e))
                          })?;
                log::info!("loading transition table from {}", path.display());
                NodeTransitions::from_json(&raw)
            }
            None => Ok(NodeTransitions::introspection()),
        }
    }
}
