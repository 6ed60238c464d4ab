// Archivo: cache.rs
// Propósito: servicio `NodeCache` con las operaciones del ciclo de vida
// (alta, búsqueda por atributos, barrido de introspecciones vencidas) y
// las operaciones administrativas sobre el caché.
use crate::config::CacheConfig;
use crate::node::{NodeContext, NodeInfo};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use node_state::{InventoryClient, LockProvider, LookupAttributes, NodeError, NodeEvent, NodeLock, NodeRow,
                 NodeState, NodeStore, NodeTransitions, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Mensaje registrado en los nodos cerrados por `clean_up`.
pub const TIMEOUT_ERROR: &str = "Introspection timeout";

/// Fachada del caché de nodos. Es barata de clonar y segura para usar
/// desde varios hilos; cada llamada construye sus propios agregados.
#[derive(Clone)]
pub struct NodeCache {
    ctx: NodeContext,
    config: CacheConfig,
}

impl NodeCache {
    /// Crea el servicio con la tabla de transiciones indicada por `config`.
    pub fn new(store: Arc<dyn NodeStore>, locks: Arc<dyn LockProvider>, config: CacheConfig) -> Result<Self> {
        let transitions = config.load_transitions()?;
        Ok(Self { ctx: NodeContext::new(store, locks, transitions),
                  config })
    }

    pub fn with_transitions(mut self, transitions: NodeTransitions) -> Self {
        self.ctx.transitions = Arc::new(transitions);
        self
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn InventoryClient>) -> Self {
        self.ctx.inventory = Some(inventory);
        self
    }

    pub fn transitions(&self) -> &NodeTransitions {
        &self.ctx.transitions
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Inicia (o reinicia) la introspección de `uuid`.
    ///
    /// Si ya existe un registro se le aplica `start` para validar que puede
    /// reiniciarse; el registro se reemplaza después por completo con
    /// `add_node`, descartando atributos y opciones previos.
    pub fn start_introspection(&self,
                               uuid: Uuid,
                               manage_boot: bool,
                               attributes: &LookupAttributes)
                               -> Result<NodeInfo> {
        let state = match self.ctx.store.get_node(&uuid)? {
            Some(row) => {
                let mut existing = NodeInfo::from_row(row, &self.ctx);
                existing.fsm_event(NodeEvent::Start, false)?
            }
            None => NodeState::Starting,
        };
        log::info!("node {}: starting introspection (state {})", uuid, state);
        self.add_node(uuid, state, manage_boot, attributes)
    }

    /// Reemplaza el registro de `uuid` por uno nuevo en `state`, con
    /// `started_at = now` y un `version_id` nuevo. Los atributos sin valores
    /// se ignoran; cada valor se guarda como una fila.
    pub fn add_node(&self,
                    uuid: Uuid,
                    state: NodeState,
                    manage_boot: bool,
                    attributes: &LookupAttributes)
                    -> Result<NodeInfo> {
        let attributes: LookupAttributes = attributes.iter()
                                                     .filter(|(_, values)| !values.is_empty())
                                                     .map(|(name, values)| (name.clone(), values.clone()))
                                                     .collect();
        let row = NodeRow::new(uuid, state, manage_boot, Utc::now());
        self.ctx.store.replace_node(&row, &attributes)?;
        log::debug!("node {}: added to cache with attributes {:?}", uuid, attributes);
        Ok(NodeInfo::from_row(row, &self.ctx))
    }

    /// Carga el agregado de `uuid`. Con `locked` adquiere su lock
    /// (bloqueante) antes de leer la fila.
    pub fn get_node(&self, uuid: Uuid, locked: bool) -> Result<NodeInfo> {
        if !locked {
            let row = self.ctx
                          .store
                          .get_node(&uuid)?
                          .ok_or_else(|| NodeError::NotFoundInCache(format!("node {}", uuid)))?;
            return Ok(NodeInfo::from_row(row, &self.ctx));
        }
        let mut lock = self.lock_blocking(uuid)?;
        match self.read_locked(uuid, lock.as_mut())? {
            Some(row) => Ok(NodeInfo::with_lock(row, &self.ctx, lock)),
            None => {
                release_quietly(lock.as_mut());
                Err(NodeError::NotFoundInCache(format!("node {}", uuid)))
            }
        }
    }

    /// Busca el nodo que mejor coincide con `attributes` y lo devuelve con
    /// su lock adquirido.
    ///
    /// Cada fila de atributo coincidente suma un punto a su nodo; los nombres
    /// se recorren en orden alfabético. Sin coincidencias devuelve
    /// `NotFoundInCache`; un empate en la puntuación máxima, `AmbiguousMatch`.
    pub fn find_node(&self, attributes: &LookupAttributes) -> Result<NodeInfo> {
        let mut scores: IndexMap<Uuid, usize> = IndexMap::new();
        for (name, values) in attributes.iter().filter(|(_, values)| !values.is_empty()) {
            for uuid in self.ctx.store.find_attribute_matches(name, values)? {
                *scores.entry(uuid).or_insert(0) += 1;
            }
        }
        let best = scores.values().copied().max().unwrap_or(0);
        if best == 0 {
            return Err(NodeError::NotFoundInCache(format!("attributes {:?}", attributes)));
        }
        let winners: Vec<Uuid> = scores.iter().filter(|(_, score)| **score == best).map(|(uuid, _)| *uuid).collect();
        let uuid = match winners.as_slice() {
            [uuid] => *uuid,
            _ => {
                log::warn!("ambiguous lookup {:?}: {} nodes scored {}", attributes, winners.len(), best);
                return Err(NodeError::AmbiguousMatch { attributes: format!("{:?}", attributes),
                                                       candidates: winners.iter().map(Uuid::to_string).collect() });
            }
        };
        log::debug!("lookup {:?} matched node {} (score {})", attributes, uuid, best);

        let mut lock = self.lock_blocking(uuid)?;
        match self.read_locked(uuid, lock.as_mut())? {
            Some(row) if row.is_active() => Ok(NodeInfo::with_lock(row, &self.ctx, lock)),
            Some(_) => {
                release_quietly(lock.as_mut());
                Err(NodeError::error(format!("introspection for node {} already finished", uuid)))
            }
            None => {
                release_quietly(lock.as_mut());
                Err(NodeError::with_code(format!("node {} was removed from the cache during lookup", uuid), 404))
            }
        }
    }

    /// Cierra con `TIMEOUT_ERROR` las introspecciones activas iniciadas
    /// hace más de `timeout`. Devuelve los uuids cerrados.
    pub fn clean_up(&self, timeout: Duration) -> Result<Vec<Uuid>> {
        self.clean_up_at(timeout, Utc::now())
    }

    /// `clean_up` con el timeout configurado.
    pub fn clean_up_expired(&self) -> Result<Vec<Uuid>> {
        self.clean_up(self.config.timeout())
    }

    /// `clean_up` tomando `now` como instante de referencia.
    pub fn clean_up_at(&self, timeout: Duration, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        if timeout <= Duration::zero() {
            return Ok(Vec::new());
        }
        let deadline = now - timeout;
        let candidates = self.ctx.store.list_stale(deadline)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        log::info!("{} introspection(s) started before {} are candidates for timeout", candidates.len(), deadline);

        let mut reaped = Vec::new();
        for candidate in candidates {
            match self.reap(candidate.uuid, deadline) {
                Ok(true) => reaped.push(candidate.uuid),
                Ok(false) => {}
                Err(e) => log::error!("node {}: failed to time out introspection: {}", candidate.uuid, e),
            }
        }
        Ok(reaped)
    }

    // Devuelve `true` si el nodo quedó cerrado por timeout.
    fn reap(&self, uuid: Uuid, deadline: DateTime<Utc>) -> Result<bool> {
        let mut lock = self.ctx.locks.get_lock(&uuid.to_string());
        if !lock.acquire(false)? {
            log::info!("node {}: locked by another actor, skipping timeout check", uuid);
            return Ok(false);
        }
        let row = match self.read_locked(uuid, lock.as_mut())? {
            Some(row) if row.is_active() && row.started_at < deadline => row,
            _ => {
                log::debug!("node {}: no longer eligible for timeout", uuid);
                lock.release()?;
                return Ok(false);
            }
        };

        let mut node = NodeInfo::with_lock(row, &self.ctx, lock);
        let outcome = Self::time_out(&mut node);
        node.release_lock()?;
        outcome?;
        log::error!("node {}: introspection timed out", uuid);
        Ok(true)
    }

    // Un solo commit terminal. Si ni `timeout` ni el evento de error son
    // legales, `finished` fuerza el estado de error y el nodo cuenta como
    // cerrado igualmente.
    fn time_out(node: &mut NodeInfo) -> Result<()> {
        let state = node.state()?;
        if state != NodeState::Waiting {
            log::warn!("node {}: timing out introspection in unexpected state {}", node.uuid(), state);
        }
        let transitions = node.transitions();
        let event = if transitions.can_apply(state, NodeEvent::Timeout) {
            NodeEvent::Timeout
        } else {
            transitions.error_event()
        };
        match node.finished(event, Some(TIMEOUT_ERROR.to_string())) {
            Err(e @ NodeError::InvalidEvent { .. }) => {
                log::warn!("node {}: {}; closed in error state", node.uuid(), e);
                Ok(())
            }
            other => other,
        }
    }

    /// Borra el nodo y todas sus filas asociadas, bajo su lock.
    pub fn delete_node(&self, uuid: Uuid) -> Result<()> {
        let mut lock = self.lock_blocking(uuid)?;
        let outcome = self.ctx.store.delete_node(&uuid);
        lock.release()?;
        outcome?;
        log::info!("node {}: removed from cache", uuid);
        Ok(())
    }

    /// Borra los nodos del caché que ya no existen en `inventory`.
    /// Devuelve los uuids borrados.
    pub fn delete_nodes_not_in(&self, inventory: &[Uuid]) -> Result<Vec<Uuid>> {
        let known: HashSet<&Uuid> = inventory.iter().collect();
        let stale: Vec<Uuid> = self.ctx.store.list_uuids()?.into_iter().filter(|u| !known.contains(u)).collect();
        if !stale.is_empty() {
            log::warn!("{} node(s) missing from inventory will be removed from cache", stale.len());
        }
        for uuid in &stale {
            self.delete_node(*uuid)?;
        }
        Ok(stale)
    }

    /// Valores `mac` de los nodos en introspección activa.
    pub fn active_macs(&self) -> Result<BTreeSet<String>> {
        Ok(self.ctx.store.active_attribute_values("mac")?.into_iter().collect())
    }

    /// Indica si hay alguna introspección activa.
    pub fn introspection_active(&self) -> Result<bool> {
        self.ctx.store.any_active()
    }

    pub fn list_nodes(&self, state: Option<NodeState>, limit: Option<usize>) -> Result<Vec<NodeRow>> {
        self.ctx.store.list_nodes(state, limit)
    }

    pub fn store_introspection_data(&self, uuid: Uuid, processed: bool, data: &[u8]) -> Result<()> {
        self.ctx.store.store_introspection_data(&uuid, processed, data)
    }

    pub fn get_introspection_data(&self, uuid: Uuid, processed: bool) -> Result<Option<Vec<u8>>> {
        self.ctx.store.get_introspection_data(&uuid, processed)
    }

    fn lock_blocking(&self, uuid: Uuid) -> Result<Box<dyn NodeLock>> {
        let mut lock = self.ctx.locks.get_lock(&uuid.to_string());
        if !lock.acquire(true)? {
            return Err(NodeError::error(format!("could not acquire lock for node {}", uuid)));
        }
        Ok(lock)
    }

    // Relee la fila con el lock ya tomado; si la lectura falla lo libera.
    fn read_locked(&self, uuid: Uuid, lock: &mut dyn NodeLock) -> Result<Option<NodeRow>> {
        self.ctx.store.get_node(&uuid).map_err(|e| {
                                          release_quietly(lock);
                                          e
                                      })
    }
}

fn release_quietly(lock: &mut dyn NodeLock) {
    if let Err(e) = lock.release() {
        log::warn!("failed to release lock {}: {}", lock.key(), e);
    }
}
