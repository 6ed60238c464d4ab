// Archivo: node/mod.rs
// Propósito: agregado `NodeInfo`, el handle en memoria sobre la fila de un
// nodo. Posee su handle de lock, el estado actual y una caché perezosa de
// atributos, opciones e inventario remoto.
//
// Un `NodeInfo` pertenece al hilo que lo creó; actores concurrentes
// construyen cada uno su propio agregado sobre el mismo uuid.
pub mod combinators;

use chrono::{DateTime, Utc};
use node_state::{new_version_id, InventoryClient, LockProvider, LookupAttributes, NodeError, NodeEvent, NodeLock,
                 NodeRow, NodeState, NodeStore, NodeTransitions, NodeUpdate, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Colaboradores compartidos por todos los agregados.
#[derive(Clone)]
pub struct NodeContext {
    pub store: Arc<dyn NodeStore>,
    pub locks: Arc<dyn LockProvider>,
    pub transitions: Arc<NodeTransitions>,
    pub inventory: Option<Arc<dyn InventoryClient>>,
}

impl NodeContext {
    pub fn new(store: Arc<dyn NodeStore>, locks: Arc<dyn LockProvider>, transitions: NodeTransitions) -> Self {
        Self { store,
               locks,
               transitions: Arc::new(transitions),
               inventory: None }
    }
}

/// Instantánea del inventario remoto tal como la devuelve el cliente.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSnapshot {
    pub node: JsonValue,
    pub ports: Vec<JsonValue>,
}

#[derive(Default)]
struct CachedData {
    attributes: Option<LookupAttributes>,
    options: Option<HashMap<String, JsonValue>>,
    remote: Option<RemoteSnapshot>,
}

/// Rellena `slot` con `load` la primera vez y lo memoiza.
fn cached<T>(slot: &mut Option<T>, load: impl FnOnce() -> Result<T>) -> Result<&T> {
    if slot.is_none() {
        *slot = Some(load()?);
    }
    slot.as_ref().ok_or_else(|| NodeError::Storage("cache slot empty after load".into()))
}

/// Agregado en memoria de un nodo en introspección.
pub struct NodeInfo {
    uuid: Uuid,
    version_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    manage_boot: bool,
    /// Estado actual; `None` tras `invalidate_cache` hasta la próxima lectura.
    state: Option<NodeState>,
    lock: Box<dyn NodeLock>,
    ctx: NodeContext,
    cache: CachedData,
}

impl NodeInfo {
    /// Construye el agregado a partir de una fila, con un handle de lock
    /// nuevo (sin adquirir).
    pub fn from_row(row: NodeRow, ctx: &NodeContext) -> Self {
        let lock = ctx.locks.get_lock(&row.uuid.to_string());
        Self::with_lock(row, ctx, lock)
    }

    /// Construye el agregado reutilizando un handle de lock ya obtenido
    /// (posiblemente adquirido).
    pub fn with_lock(row: NodeRow, ctx: &NodeContext, lock: Box<dyn NodeLock>) -> Self {
        Self { uuid: row.uuid,
               version_id: row.version_id,
               started_at: row.started_at,
               finished_at: row.finished_at,
               error: row.error,
               manage_boot: row.manage_boot,
               state: Some(row.state),
               lock,
               ctx: ctx.clone(),
               cache: CachedData::default() }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn manage_boot(&self) -> bool {
        self.manage_boot
    }

    pub fn transitions(&self) -> &NodeTransitions {
        &self.ctx.transitions
    }

    // ---- lock ----

    /// Adquiere el lock del nodo. Idempotente por handle: devuelve `true`
    /// sin pedirlo de nuevo si este agregado ya lo tiene.
    pub fn acquire_lock(&mut self, blocking: bool) -> Result<bool> {
        if self.lock.is_locked() {
            return Ok(true);
        }
        log::debug!("node {}: attempting to acquire lock (blocking={})", self.uuid, blocking);
        let acquired = self.lock.acquire(blocking)?;
        if acquired {
            log::debug!("node {}: lock acquired", self.uuid);
        } else {
            log::debug!("node {}: unable to acquire lock", self.uuid);
        }
        Ok(acquired)
    }

    /// Libera el lock si este agregado lo tiene; no-op en otro caso.
    pub fn release_lock(&mut self) -> Result<()> {
        if self.lock.is_locked() {
            self.lock.release()?;
            log::debug!("node {}: lock released", self.uuid);
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    // ---- caché perezosa ----

    /// Descarta atributos, opciones, inventario y estado: la próxima
    /// lectura vuelve al store.
    pub fn invalidate_cache(&mut self) {
        self.cache = CachedData::default();
        self.state = None;
    }

    /// Estado actual del nodo (se relee del store tras `invalidate_cache`).
    pub fn state(&mut self) -> Result<NodeState> {
        if let Some(state) = self.state {
            return Ok(state);
        }
        let row = self.ctx
                      .store
                      .get_node(&self.uuid)?
                      .ok_or_else(|| NodeError::NotFoundInCache(format!("node {}", self.uuid)))?;
        self.state = Some(row.state);
        Ok(row.state)
    }

    pub fn attributes(&mut self) -> Result<&LookupAttributes> {
        let (store, uuid) = (&self.ctx.store, self.uuid);
        cached(&mut self.cache.attributes, || store.get_attributes(&uuid))
    }

    pub fn options(&mut self) -> Result<&HashMap<String, JsonValue>> {
        let (store, uuid) = (&self.ctx.store, self.uuid);
        cached(&mut self.cache.options, || store.get_options(&uuid))
    }

    /// Instantánea del inventario remoto (nodo + puertos), pedida una vez.
    pub fn remote_snapshot(&mut self) -> Result<&RemoteSnapshot> {
        let (inventory, uuid) = (&self.ctx.inventory, self.uuid);
        cached(&mut self.cache.remote, || {
            let client =
                inventory.as_ref()
                         .ok_or_else(|| NodeError::Inventory("no inventory client configured".into()))?;
            Ok(RemoteSnapshot { node: client.get_node(&uuid)?,
                                ports: client.list_ports(&uuid)? })
        })
    }

    pub fn ports(&mut self) -> Result<&[JsonValue]> {
        Ok(&self.remote_snapshot()?.ports)
    }

    /// Inserta o reemplaza una opción y actualiza la caché si ya estaba
    /// cargada.
    pub fn set_option(&mut self, name: &str, value: JsonValue) -> Result<()> {
        self.ctx.store.set_option(&self.uuid, name, &value)?;
        if let Some(options) = self.cache.options.as_mut() {
            options.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Añade valores a un atributo de búsqueda.
    pub fn add_attribute(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        self.ctx.store.add_attribute(&self.uuid, name, &values)?;
        if let Some(attributes) = self.cache.attributes.as_mut() {
            attributes.entry(name.to_string()).or_default().extend(values);
        }
        Ok(())
    }

    // ---- persistencia ----

    /// Commit optimista: escribe `update` sólo si la fila conserva el
    /// `version_id` que este agregado leyó; genera uno nuevo en cada
    /// escritura. `NodeError::RaceCondition` si otro escritor avanzó.
    pub fn commit(&mut self, update: NodeUpdate) -> Result<()> {
        let new_version = new_version_id();
        self.ctx.store.compare_and_swap(&self.uuid, &self.version_id, &new_version, &update)?;
        log::debug!("node {}: committed {:?} (version {} -> {})",
                    self.uuid, update, self.version_id, new_version);
        self.version_id = new_version;
        if let Some(state) = update.state {
            self.state = Some(state);
        }
        if let Some(finished_at) = update.finished_at {
            self.finished_at = finished_at;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(manage_boot) = update.manage_boot {
            self.manage_boot = manage_boot;
        }
        Ok(())
    }

    /// Procesa `event` contra el estado actual y persiste el resultado si
    /// cambia (las transiciones a sí mismo no escriben).
    ///
    /// Si el estado resultante es terminal el nodo se cierra en el mismo
    /// commit: se fija `finished_at` y se borran atributos y opciones. El
    /// lock no se toca; sigue siendo del caller.
    ///
    /// Si el evento es inválido y `strict` es `true`, el nodo se lleva al
    /// estado terminal de error (registrando el fallo) antes de devolver
    /// `NodeError::InvalidEvent`.
    pub fn fsm_event(&mut self, event: NodeEvent, strict: bool) -> Result<NodeState> {
        let current = self.state()?;
        match self.ctx.transitions.apply(current, event) {
            Ok(next) if next == current => Ok(next),
            Ok(next) if self.ctx.transitions.is_terminal(next) => {
                log::debug!("node {}: {} -[{}]-> {} (terminal)", self.uuid, current, event, next);
                let error = (next == self.ctx.transitions.error_state())
                    .then(|| format!("introspection ended by event {} in state {}", event, current));
                self.close(next, error)?;
                Ok(next)
            }
            Ok(next) => {
                log::debug!("node {}: {} -[{}]-> {}", self.uuid, current, event, next);
                self.commit(NodeUpdate::new().state(next))?;
                Ok(next)
            }
            Err(err) => {
                if strict {
                    log::error!("node {}: {}", self.uuid, err);
                    if let Err(e) = self.finish_with_error(err.to_string()) {
                        log::warn!("node {}: could not record invalid event: {}", self.uuid, e);
                    }
                }
                Err(err)
            }
        }
    }

    /// Termina la introspección: libera el lock, fija `finished_at` y
    /// `error`, procesa `event` y borra atributos de búsqueda y opciones.
    ///
    /// Si `event` no es legal en el estado actual, el nodo se fuerza al
    /// estado de error, se persiste igualmente y se devuelve
    /// `NodeError::InvalidEvent`.
    pub fn finished(&mut self, event: NodeEvent, error: Option<String>) -> Result<()> {
        self.release_lock()?;
        let mut error = error;
        let current = self.state()?;
        let (next, invalid) = match self.ctx.transitions.apply(current, event) {
            Ok(next) => (next, None),
            Err(err) => {
                let forced = self.ctx.transitions.error_state();
                log::error!("node {}: {}; forcing state {}", self.uuid, err, forced);
                if error.is_none() {
                    error = Some(err.to_string());
                }
                (forced, Some(err))
            }
        };
        self.close(next, error)?;
        match invalid {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // Un único commit con `(state, finished_at, error)`; después borra los
    // datos de búsqueda.
    fn close(&mut self, state: NodeState, error: Option<String>) -> Result<()> {
        self.commit(NodeUpdate::new().state(state).finished_at(Some(Utc::now())).error(error))?;
        self.ctx.store.clear_lookup_data(&self.uuid)?;
        self.cache.attributes = None;
        self.cache.options = None;
        match &self.error {
            Some(msg) => log::error!("node {}: introspection finished with error: {}", self.uuid, msg),
            None => log::info!("node {}: introspection finished successfully", self.uuid),
        }
        Ok(())
    }

    /// Lleva el nodo al estado terminal de error con `message`.
    pub(crate) fn finish_with_error(&mut self, message: String) -> Result<()> {
        let event = self.ctx.transitions.error_event();
        self.finished(event, Some(message))
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInfo")
         .field("uuid", &self.uuid)
         .field("state", &self.state)
         .field("version_id", &self.version_id)
         .field("started_at", &self.started_at)
         .field("finished_at", &self.finished_at)
         .field("error", &self.error)
         .field("locked", &self.lock.is_locked())
         .finish()
    }
}

impl Drop for NodeInfo {
    // Sólo avisa: la liberación es siempre explícita.
    fn drop(&mut self) {
        if self.lock.is_locked() {
            log::warn!("node {}: aggregate dropped while still holding its lock", self.uuid);
        }
    }
}
