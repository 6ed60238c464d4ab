// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y wiring rápido.
//
// Incluye un `NodeStore` en memoria (`InMemoryNodeStore`) y un inventario
// remoto estático (`StaticInventory`). No son durables y se usan para demos
// o pruebas locales.
use crate::domain::{LookupAttributes, NodeRow, NodeState, NodeUpdate};
use crate::errors::{NodeError, Result};
use crate::repository::{InventoryClient, NodeStore};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    nodes: HashMap<Uuid, NodeRow>,
    /// Filas `(name, value, node_uuid)` en orden de inserción.
    attributes: Vec<(String, String, Uuid)>,
    options: HashMap<(Uuid, String), JsonValue>,
    data: HashMap<(Uuid, bool), Vec<u8>>,
}

impl Tables {
    fn purge(&mut self, uuid: &Uuid) {
        self.nodes.remove(uuid);
        self.attributes.retain(|(_, _, u)| u != uuid);
        self.options.retain(|(u, _), _| u != uuid);
        self.data.retain(|(u, _), _| u != uuid);
    }
}

/// `NodeStore` en memoria. Un único mutex protege todas las tablas, por lo
/// que cada operación es atómica (equivalente a una transacción).
#[derive(Default)]
pub struct InMemoryNodeStore {
    tables: Mutex<Tables>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper para mapear `Mutex::lock()` en un `Result` con
    /// `NodeError::Storage`.
    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|e| NodeError::Storage(format!("mutex poisoned: {:?}", e)))
    }

    /// Número de filas de atributo (todas las de todos los nodos).
    pub fn attribute_row_count(&self) -> Result<usize> {
        Ok(self.lock()?.attributes.len())
    }
}

impl NodeStore for InMemoryNodeStore {
    fn get_node(&self, uuid: &Uuid) -> Result<Option<NodeRow>> {
        Ok(self.lock()?.nodes.get(uuid).cloned())
    }

    fn replace_node(&self, row: &NodeRow, attributes: &LookupAttributes) -> Result<()> {
        let mut t = self.lock()?;
        t.purge(&row.uuid);
        t.nodes.insert(row.uuid, row.clone());
        for (name, values) in attributes {
            for v in values {
                t.attributes.push((name.clone(), v.clone(), row.uuid));
            }
        }
        Ok(())
    }

    fn compare_and_swap(&self,
                        uuid: &Uuid,
                        expected_version: &str,
                        new_version: &str,
                        update: &NodeUpdate)
                        -> Result<()> {
        let mut t = self.lock()?;
        let row = match t.nodes.get_mut(uuid).filter(|r| r.version_id == expected_version) {
            Some(row) => row,
            None => {
                log::debug!("node {}: version {} is no longer current", uuid, expected_version);
                return Err(NodeError::RaceCondition(uuid.to_string()));
            }
        };
        update.apply_to(row);
        row.version_id = new_version.to_string();
        Ok(())
    }

    fn delete_node(&self, uuid: &Uuid) -> Result<()> {
        self.lock()?.purge(uuid);
        Ok(())
    }

    fn clear_lookup_data(&self, uuid: &Uuid) -> Result<()> {
        let mut t = self.lock()?;
        t.attributes.retain(|(_, _, u)| u != uuid);
        t.options.retain(|(u, _), _| u != uuid);
        Ok(())
    }

    fn get_attributes(&self, uuid: &Uuid) -> Result<LookupAttributes> {
        let t = self.lock()?;
        let mut out = LookupAttributes::new();
        for (name, value, _) in t.attributes.iter().filter(|(_, _, u)| u == uuid) {
            out.entry(name.clone()).or_default().push(value.clone());
        }
        Ok(out)
    }

    fn add_attribute(&self, uuid: &Uuid, name: &str, values: &[String]) -> Result<()> {
        let mut t = self.lock()?;
        if !t.nodes.contains_key(uuid) {
            return Err(NodeError::NotFoundInCache(format!("node {}", uuid)));
        }
        for v in values {
            t.attributes.push((name.to_string(), v.clone(), *uuid));
        }
        Ok(())
    }

    fn find_attribute_matches(&self, name: &str, values: &[String]) -> Result<Vec<Uuid>> {
        let t = self.lock()?;
        Ok(t.attributes
            .iter()
            .filter(|(n, v, _)| n == name && values.contains(v))
            .map(|(_, _, u)| *u)
            .collect())
    }

    fn active_attribute_values(&self, name: &str) -> Result<Vec<String>> {
        let t = self.lock()?;
        Ok(t.attributes
            .iter()
            .filter(|(n, _, u)| n == name && t.nodes.get(u).map(|r| r.is_active()).unwrap_or(false))
            .map(|(_, v, _)| v.clone())
            .collect())
    }

    fn get_options(&self, uuid: &Uuid) -> Result<HashMap<String, JsonValue>> {
        let t = self.lock()?;
        Ok(t.options
            .iter()
            .filter(|((u, _), _)| u == uuid)
            .map(|((_, name), v)| (name.clone(), v.clone()))
            .collect())
    }

    fn set_option(&self, uuid: &Uuid, name: &str, value: &JsonValue) -> Result<()> {
        let mut t = self.lock()?;
        if !t.nodes.contains_key(uuid) {
            return Err(NodeError::NotFoundInCache(format!("node {}", uuid)));
        }
        t.options.insert((*uuid, name.to_string()), value.clone());
        Ok(())
    }

    fn list_stale(&self, deadline: DateTime<Utc>) -> Result<Vec<NodeRow>> {
        let t = self.lock()?;
        let mut rows: Vec<NodeRow> = t.nodes
                                      .values()
                                      .filter(|r| r.is_active() && r.started_at < deadline)
                                      .cloned()
                                      .collect();
        rows.sort_by_key(|r| r.started_at);
        Ok(rows)
    }

    fn list_nodes(&self, state: Option<NodeState>, limit: Option<usize>) -> Result<Vec<NodeRow>> {
        let t = self.lock()?;
        let mut rows: Vec<NodeRow> = t.nodes
                                      .values()
                                      .filter(|r| state.map(|s| r.state == s).unwrap_or(true))
                                      .cloned()
                                      .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn list_uuids(&self) -> Result<Vec<Uuid>> {
        Ok(self.lock()?.nodes.keys().copied().collect())
    }

    fn any_active(&self) -> Result<bool> {
        Ok(self.lock()?.nodes.values().any(NodeRow::is_active))
    }

    fn store_introspection_data(&self, uuid: &Uuid, processed: bool, data: &[u8]) -> Result<()> {
        self.lock()?.data.insert((*uuid, processed), data.to_vec());
        Ok(())
    }

    fn get_introspection_data(&self, uuid: &Uuid, processed: bool) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.data.get(&(*uuid, processed)).cloned())
    }
}

/// Inventario remoto estático para pruebas. Cuenta las llamadas para
/// poder verificar el comportamiento de la caché.
#[derive(Default)]
pub struct StaticInventory {
    nodes: Mutex<HashMap<Uuid, JsonValue>>,
    ports: Mutex<HashMap<Uuid, Vec<JsonValue>>>,
    calls: AtomicUsize,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un nodo y sus puertos.
    pub fn insert(&self, uuid: Uuid, node: JsonValue, ports: Vec<JsonValue>) {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).insert(uuid, node);
        self.ports.lock().unwrap_or_else(|e| e.into_inner()).insert(uuid, ports);
    }

    /// Número de llamadas recibidas (`get_node` + `list_ports`).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InventoryClient for StaticInventory {
    fn get_node(&self, uuid: &Uuid) -> Result<JsonValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uuid)
            .cloned()
            .ok_or_else(|| NodeError::Inventory(format!("node {} not found in inventory", uuid)))
    }

    fn list_ports(&self, uuid: &Uuid) -> Result<Vec<JsonValue>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ports.lock().unwrap_or_else(|e| e.into_inner()).get(uuid).cloned().unwrap_or_default())
    }
}
