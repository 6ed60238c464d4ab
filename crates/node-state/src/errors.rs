// Archivo: errors.rs
// Propósito: definir los errores del ciclo de vida de nodos y el alias
// Result<T> usado por las APIs del crate.
use thiserror::Error;

/// Errores comunes del caché de nodos.
///
/// - `NotFoundInCache`: ningún registro coincide con la búsqueda.
/// - `Error`: fallo operativo genérico con mensaje y código para el caller.
/// - `RaceCondition`: conflicto optimista sobre `version_id`.
/// - `InvalidEvent`: transición no declarada en la tabla.
/// - `AmbiguousMatch`: empate en la búsqueda por atributos.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Ningún nodo del caché coincide con la búsqueda.
    #[error("No encontrado en el caché: {0}")]
    NotFoundInCache(String),
    /// Error operativo con código (estilo HTTP) para la capa de peticiones.
    #[error("{message}")]
    Error { message: String, code: u16 },
    /// Otro escritor avanzó el `version_id` antes que nosotros.
    #[error("Condición de carrera en el nodo {0}: el registro cambió desde la última lectura")]
    RaceCondition(String),
    /// No existe arista `(state, event)` en la tabla de transiciones.
    #[error("Evento inválido \"{event}\" para el estado \"{state}\"")]
    InvalidEvent { state: String, event: String },
    /// Varios nodos empatan con la puntuación máxima.
    #[error("Varios nodos coinciden con la búsqueda {attributes}: {candidates:?}")]
    AmbiguousMatch { attributes: String, candidates: Vec<String> },
    /// Error de almacenamiento (BD, pool, mutex envenenado).
    #[error("Error de almacenamiento: {0}")]
    Storage(String),
    /// Error de serialización JSON (opciones, tabla de transiciones).
    #[error("Error de serializacion: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Error devuelto por el cliente de inventario remoto.
    #[error("Error de inventario: {0}")]
    Inventory(String),
}

/// Clase de un `NodeError` sin datos asociados. Se usa para declarar
/// conjuntos de errores reintentables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFoundInCache,
    Error,
    RaceCondition,
    InvalidEvent,
    AmbiguousMatch,
    Storage,
    Serialization,
    Inventory,
}

impl NodeError {
    /// Construye un `Error` genérico con código 400.
    pub fn error(message: impl Into<String>) -> Self {
        NodeError::Error { message: message.into(),
                           code: 400 }
    }

    /// Construye un `Error` genérico con el código indicado.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        NodeError::Error { message: message.into(),
                           code }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::NotFoundInCache(_) => ErrorKind::NotFoundInCache,
            NodeError::Error { .. } => ErrorKind::Error,
            NodeError::RaceCondition(_) => ErrorKind::RaceCondition,
            NodeError::InvalidEvent { .. } => ErrorKind::InvalidEvent,
            NodeError::AmbiguousMatch { .. } => ErrorKind::AmbiguousMatch,
            NodeError::Storage(_) => ErrorKind::Storage,
            NodeError::Serialization(_) => ErrorKind::Serialization,
            NodeError::Inventory(_) => ErrorKind::Inventory,
        }
    }

    /// Código de estado sugerido para la capa de peticiones.
    pub fn code(&self) -> u16 {
        match self {
            NodeError::NotFoundInCache(_) => 404,
            NodeError::Error { code, .. } => *code,
            NodeError::RaceCondition(_) | NodeError::AmbiguousMatch { .. } => 409,
            NodeError::InvalidEvent { .. } => 400,
            NodeError::Storage(_) | NodeError::Serialization(_) | NodeError::Inventory(_) => 500,
        }
    }
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, NodeError>;
