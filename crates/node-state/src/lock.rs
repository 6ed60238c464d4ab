// Archivo: lock.rs
// Propósito: contrato de exclusión mutua por nodo (`LockProvider`,
// `NodeLock`) y un proveedor en proceso basado en `Mutex` + `Condvar`.
//
// Los handles nunca liberan el lock al destruirse: quien adquiere es
// responsable de liberar explícitamente en todos los caminos.
use crate::errors::{NodeError, Result};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

/// Handle de lock ligado a una clave (el uuid del nodo).
///
/// Re-entrante por handle: `acquire` sobre un handle que ya tiene la clave
/// devuelve `true` sin volver a pedirla al proveedor. `release` sobre un
/// handle que no la tiene es un no-op.
pub trait NodeLock: Send {
    fn key(&self) -> &str;

    /// Intenta tomar la clave. Con `blocking = false` devuelve `false` de
    /// inmediato si otro handle la tiene.
    fn acquire(&mut self, blocking: bool) -> Result<bool>;

    fn release(&mut self) -> Result<()>;

    /// Indica si *este* handle tiene la clave.
    fn is_locked(&self) -> bool;
}

/// Proveedor de locks con nombre. Puede estar respaldado por un mutex en
/// proceso o por un servicio de coordinación distribuido.
pub trait LockProvider: Send + Sync {
    /// Crea un handle nuevo (sin adquirir) para la clave.
    fn get_lock(&self, key: &str) -> Box<dyn NodeLock>;

    /// Indica si algún handle tiene actualmente la clave.
    fn is_held(&self, key: &str) -> bool;
}

#[derive(Default)]
struct LockSlot {
    held: Mutex<bool>,
    released: Condvar,
}

/// Proveedor en proceso: un slot (`Mutex<bool>` + `Condvar`) por clave.
///
/// El slot vive mientras exista algún handle de su clave o alguien la
/// tenga; el último handle libre en destruirse lo retira del mapa.
#[derive(Clone, Default)]
pub struct InProcessLockProvider {
    slots: Arc<DashMap<String, Arc<LockSlot>>>,
}

impl InProcessLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<LockSlot> {
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Número de claves con slot vivo.
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for InProcessLockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessLockProvider").field("keys", &self.slots.len()).finish()
    }
}

impl LockProvider for InProcessLockProvider {
    fn get_lock(&self, key: &str) -> Box<dyn NodeLock> {
        Box::new(InProcessLock { key: key.to_string(),
                                 slot: self.slot(key),
                                 slots: self.slots.clone(),
                                 locked: false })
    }

    fn is_held(&self, key: &str) -> bool {
        let slot = match self.slots.get(key) {
            Some(s) => s.value().clone(),
            None => return false,
        };
        let held = *slot.held.lock().unwrap_or_else(|e| e.into_inner());
        held
    }
}

/// Handle del proveedor en proceso.
pub struct InProcessLock {
    key: String,
    slot: Arc<LockSlot>,
    slots: Arc<DashMap<String, Arc<LockSlot>>>,
    locked: bool,
}

fn poisoned<E: fmt::Display>(e: E) -> NodeError {
    NodeError::Storage(format!("lock poisoned: {}", e))
}

impl NodeLock for InProcessLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn acquire(&mut self, blocking: bool) -> Result<bool> {
        if self.locked {
            return Ok(true);
        }
        let mut held = self.slot.held.lock().map_err(poisoned)?;
        while *held {
            if !blocking {
                return Ok(false);
            }
            held = self.slot.released.wait(held).map_err(poisoned)?;
        }
        *held = true;
        self.locked = true;
        Ok(true)
    }

    fn release(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        {
            let mut held = self.slot.held.lock().map_err(poisoned)?;
            *held = false;
        }
        self.locked = false;
        self.slot.released.notify_one();
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for InProcessLock {
    fn drop(&mut self) {
        if self.locked {
            return;
        }
        // mapa + este handle: nadie más puede estar esperando el slot
        self.slots.remove_if(&self.key, |_, slot| Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2);
    }
}

impl fmt::Debug for InProcessLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessLock").field("key", &self.key).field("locked", &self.locked).finish()
    }
}
