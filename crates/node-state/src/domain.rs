// Archivo: domain.rs
// Propósito: tipos de dominio del caché de nodos: estados, eventos y las
// filas persistidas (nodo, atributos de búsqueda, opciones y datos de
// introspección).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Estados del ciclo de vida de un nodo en introspección.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Enrolling,
    Starting,
    Waiting,
    Processing,
    Reapplying,
    Finished,
    Error,
}

impl NodeState {
    pub const ALL: [NodeState; 7] = [NodeState::Enrolling,
                                     NodeState::Starting,
                                     NodeState::Waiting,
                                     NodeState::Processing,
                                     NodeState::Reapplying,
                                     NodeState::Finished,
                                     NodeState::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Enrolling => "enrolling",
            NodeState::Starting => "starting",
            NodeState::Waiting => "waiting",
            NodeState::Processing => "processing",
            NodeState::Reapplying => "reapplying",
            NodeState::Finished => "finished",
            NodeState::Error => "error",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL.iter()
                      .copied()
                      .find(|st| st.as_str() == s.to_lowercase())
                      .ok_or_else(|| format!("estado desconocido: {}", s))
    }
}

/// Eventos que mueven un nodo entre estados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEvent {
    Start,
    Wait,
    Process,
    Finish,
    Error,
    Timeout,
    Abort,
    Reapply,
}

impl NodeEvent {
    pub const ALL: [NodeEvent; 8] = [NodeEvent::Start,
                                     NodeEvent::Wait,
                                     NodeEvent::Process,
                                     NodeEvent::Finish,
                                     NodeEvent::Error,
                                     NodeEvent::Timeout,
                                     NodeEvent::Abort,
                                     NodeEvent::Reapply];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeEvent::Start => "start",
            NodeEvent::Wait => "wait",
            NodeEvent::Process => "process",
            NodeEvent::Finish => "finish",
            NodeEvent::Error => "error",
            NodeEvent::Timeout => "timeout",
            NodeEvent::Abort => "abort",
            NodeEvent::Reapply => "reapply",
        }
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeEvent::ALL.iter()
                      .copied()
                      .find(|ev| ev.as_str() == s.to_lowercase())
                      .ok_or_else(|| format!("evento desconocido: {}", s))
    }
}

/// Fila persistida de un nodo.
///
/// Invariante: `finished_at` es `Some` sólo en estados terminales y
/// `error` sólo acompaña al estado terminal de error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub uuid: Uuid,
    pub state: NodeState,
    /// Token opaco regenerado en cada commit (locking optimista).
    pub version_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub manage_boot: bool,
}

impl NodeRow {
    /// Crea una fila nueva con un `version_id` recién generado.
    pub fn new(uuid: Uuid, state: NodeState, manage_boot: bool, started_at: DateTime<Utc>) -> Self {
        Self { uuid,
               state,
               version_id: new_version_id(),
               started_at,
               finished_at: None,
               error: None,
               manage_boot }
    }

    pub fn is_active(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Genera un token de versión nuevo.
pub fn new_version_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Campos a escribir en un commit. `None` deja el campo intacto; los
/// campos anulables usan `Option<Option<_>>` para poder escribir `NULL`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub state: Option<NodeState>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
    pub manage_boot: Option<bool>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: NodeState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn finished_at(mut self, finished_at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = Some(finished_at);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn manage_boot(mut self, manage_boot: bool) -> Self {
        self.manage_boot = Some(manage_boot);
        self
    }

    /// Aplica los campos presentes sobre una fila (sin tocar la versión).
    pub fn apply_to(&self, row: &mut NodeRow) {
        if let Some(state) = self.state {
            row.state = state;
        }
        if let Some(finished_at) = self.finished_at {
            row.finished_at = finished_at;
        }
        if let Some(error) = &self.error {
            row.error = error.clone();
        }
        if let Some(manage_boot) = self.manage_boot {
            row.manage_boot = manage_boot;
        }
    }
}

/// Atributos de búsqueda: nombre -> valores. Ordenado por nombre para que
/// la búsqueda sea determinista.
pub type LookupAttributes = BTreeMap<String, Vec<String>>;

/// Helper ergonómico para construir `LookupAttributes` a partir de pares.
pub fn lookup_attributes<I, K, V>(pairs: I) -> LookupAttributes
    where I: IntoIterator<Item = (K, Vec<V>)>,
          K: Into<String>,
          V: Into<String>
{
    pairs.into_iter()
         .map(|(k, vs)| (k.into(), vs.into_iter().map(Into::into).collect()))
         .collect()
}
