//! Crate `node-state` — tipos y contratos del ciclo de vida de nodos en
//! introspección.
//!
//! Este crate define la tabla de transiciones (`TransitionTable`) y su
//! ejecutor puro `apply`, las filas persistidas (`NodeRow`, atributos,
//! opciones, datos de introspección), el contrato de persistencia
//! `NodeStore`, el contrato de exclusión mutua `LockProvider` y el cliente
//! de inventario remoto `InventoryClient`. También incluye implementaciones
//! en memoria útiles para pruebas (`InMemoryNodeStore`,
//! `InProcessLockProvider`).
//!
//! Diseño resumido:
//! - La tabla de transiciones es un valor inmutable; el estado actual vive
//!   en el agregado como un simple valor.
//! - Locking optimista: cada commit compara el `version_id` leído y genera
//!   uno nuevo (`NodeError::RaceCondition` si otro escritor avanzó).
//! - Locks por nodo: un handle por agregado, re-entrante por handle.
//!
//! Ejemplo rápido:
//! ```rust
//! use node_state::{NodeEvent, NodeState, TransitionTable};
//! let table = TransitionTable::introspection();
//! let next = table.apply(NodeState::Starting, NodeEvent::Wait).unwrap();
//! assert_eq!(next, NodeState::Waiting);
//! ```
pub mod domain;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod repository;
pub mod stubs;

pub use domain::*;
pub use engine::*;
pub use errors::*;
pub use lock::*;
pub use repository::*;
pub use stubs::*;
