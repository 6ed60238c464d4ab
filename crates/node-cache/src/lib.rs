//! node-cache: caché de nodos en introspección
//!
//! Define el agregado `NodeInfo` (lock por nodo, estado actual, caché
//! perezosa de atributos/opciones/inventario y commit optimista), los
//! combinadores de transición (`before`, `after`, `error_guard`,
//! `compose`) y el servicio `NodeCache` con las operaciones de ciclo de
//! vida: `start_introspection`, `add_node`, `find_node`, `finished` (en el
//! agregado) y `clean_up`.

pub mod cache;
pub mod config;
pub mod node;

pub use cache::{NodeCache, TIMEOUT_ERROR};
pub use config::CacheConfig;
pub use node::combinators::{after, before, compose, error_guard, DEFAULT_RETRIABLE};
pub use node::{NodeContext, NodeInfo, RemoteSnapshot};
pub use node_state::{ErrorKind, LookupAttributes, NodeError, NodeEvent, NodeState, NodeTransitions, Result};
