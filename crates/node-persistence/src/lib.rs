//! Persistencia Diesel para el trait `NodeStore`.
//! Este archivo expone el módulo `schema` y reexporta el repositorio Diesel
//! que implementa el contrato de persistencia del caché de nodos. La
//! implementación detallada está en `node_persistence.rs`.

mod node_persistence;
pub mod schema;

pub use node_persistence::{new_from_env, DieselNodeStore, MIGRATIONS};
