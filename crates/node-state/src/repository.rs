// Archivo: repository.rs
// Propósito: definir el trait `NodeStore` (persistencia del caché de nodos)
// y el trait `InventoryClient` (cliente del inventario remoto). Describe el
// contrato que deben implementar las persistencias (Diesel, in-memory, etc.).
use crate::domain::{LookupAttributes, NodeRow, NodeState, NodeUpdate};
use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Contrato de persistencia del caché de nodos.
///
/// Todas las mutaciones de varias filas para un mismo uuid ocurren dentro
/// de una única transacción del almacenamiento concreto.
pub trait NodeStore: Send + Sync {
    /// Obtiene la fila del nodo, si existe.
    fn get_node(&self, uuid: &Uuid) -> Result<Option<NodeRow>>;

    /// Reemplaza por completo el registro del nodo: borra la fila previa (y
    /// en cascada atributos, opciones y datos de introspección), inserta
    /// `row` y adjunta cada valor de `attributes` como una fila.
    fn replace_node(&self, row: &NodeRow, attributes: &LookupAttributes) -> Result<()>;

    /// Compare-and-swap sobre `(uuid, expected_version)`: escribe `update` y
    /// `new_version`. Devuelve `NodeError::RaceCondition` si ninguna fila
    /// coincide (otro escritor avanzó la versión o la fila desapareció).
    fn compare_and_swap(&self,
                        uuid: &Uuid,
                        expected_version: &str,
                        new_version: &str,
                        update: &NodeUpdate)
                        -> Result<()>;

    /// Borra la fila del nodo y todas sus filas asociadas.
    fn delete_node(&self, uuid: &Uuid) -> Result<()>;

    /// Borra atributos de búsqueda y opciones (los datos de introspección
    /// se conservan).
    fn clear_lookup_data(&self, uuid: &Uuid) -> Result<()>;

    /// Atributos de búsqueda del nodo agrupados por nombre.
    fn get_attributes(&self, uuid: &Uuid) -> Result<LookupAttributes>;

    /// Añade filas de atributo `(name, value, uuid)`, una por valor.
    fn add_attribute(&self, uuid: &Uuid, name: &str, values: &[String]) -> Result<()>;

    /// Uuids de las filas de atributo con `name` y valor en `values`. Un
    /// uuid aparece una vez por cada fila coincidente.
    fn find_attribute_matches(&self, name: &str, values: &[String]) -> Result<Vec<Uuid>>;

    /// Valores de `name` de todos los nodos activos (`finished_at` nulo).
    fn active_attribute_values(&self, name: &str) -> Result<Vec<String>>;

    fn get_options(&self, uuid: &Uuid) -> Result<HashMap<String, JsonValue>>;

    /// Inserta o reemplaza la opción `name` del nodo.
    fn set_option(&self, uuid: &Uuid, name: &str, value: &JsonValue) -> Result<()>;

    /// Nodos activos con `started_at < deadline`.
    fn list_stale(&self, deadline: DateTime<Utc>) -> Result<Vec<NodeRow>>;

    /// Lista nodos ordenados por `started_at` descendente, filtrando
    /// opcionalmente por estado.
    fn list_nodes(&self, state: Option<NodeState>, limit: Option<usize>) -> Result<Vec<NodeRow>>;

    fn list_uuids(&self) -> Result<Vec<Uuid>>;

    /// Indica si existe al menos un nodo activo.
    fn any_active(&self) -> Result<bool>;

    /// Guarda (o sobrescribe) el blob `(uuid, processed)`.
    fn store_introspection_data(&self, uuid: &Uuid, processed: bool, data: &[u8]) -> Result<()>;

    fn get_introspection_data(&self, uuid: &Uuid, processed: bool) -> Result<Option<Vec<u8>>>;
}

/// Cliente del inventario remoto (servicio de hardware). El caché sólo
/// guarda lo que devuelve; nunca interpreta su contenido.
pub trait InventoryClient: Send + Sync {
    /// Ficha del nodo en el inventario.
    fn get_node(&self, uuid: &Uuid) -> Result<JsonValue>;

    /// Puertos registrados para el nodo.
    fn list_ports(&self, uuid: &Uuid) -> Result<Vec<JsonValue>>;
}
