// Archivo: node/combinators.rs
// Propósito: combinadores que envuelven una operación sobre un `NodeInfo`
// con el procesamiento de un evento de la máquina de estados.
//
// Son funciones de orden superior normales: cada operación del ciclo de
// vida se compone explícitamente en su sitio de definición.
use super::NodeInfo;
use node_state::{ErrorKind, NodeEvent, Result};

/// Errores que `error_guard` deja pasar sin forzar el estado de error:
/// representan contención que el caller puede reintentar.
pub const DEFAULT_RETRIABLE: &[ErrorKind] = &[ErrorKind::InvalidEvent, ErrorKind::RaceCondition];

/// Procesa `event` y, si es válido, ejecuta `op`.
///
/// Con `strict` un evento inválido lleva el nodo al estado de error antes
/// de devolver `NodeError::InvalidEvent`; sin él sólo se devuelve el error.
pub fn before<T, F>(node: &mut NodeInfo, event: NodeEvent, strict: bool, op: F) -> Result<T>
    where F: FnOnce(&mut NodeInfo) -> Result<T>
{
    node.fsm_event(event, strict)?;
    op(node)
}

/// Ejecuta `op` y después procesa `event` (no estricto). Repetir el evento
/// en un estado que se transiciona a sí mismo es un no-op válido.
pub fn after<T, F>(node: &mut NodeInfo, event: NodeEvent, op: F) -> Result<T>
    where F: FnOnce(&mut NodeInfo) -> Result<T>
{
    let out = op(node)?;
    node.fsm_event(event, false)?;
    Ok(out)
}

/// Ejecuta `op`. Si falla con un error fuera de `retriable`, lleva el nodo
/// al estado terminal de error con el mensaje del fallo y devuelve el
/// error original.
pub fn error_guard<T, F>(node: &mut NodeInfo, retriable: &[ErrorKind], op: F) -> Result<T>
    where F: FnOnce(&mut NodeInfo) -> Result<T>
{
    match op(node) {
        Ok(out) => Ok(out),
        Err(err) if retriable.contains(&err.kind()) => Err(err),
        Err(err) => {
            log::error!("node {}: unexpected failure: {}", node.uuid(), err);
            if let Err(secondary) = node.finish_with_error(err.to_string()) {
                log::warn!("node {}: could not record failure: {}", node.uuid(), secondary);
            }
            Err(err)
        }
    }
}

/// Operación completa del ciclo de vida:
/// `error_guard(before(event, strict))` si `reentrant` es `false`,
/// `error_guard(after(event))` en otro caso.
pub fn compose<T, F>(node: &mut NodeInfo, event: NodeEvent, reentrant: bool, op: F) -> Result<T>
    where F: FnOnce(&mut NodeInfo) -> Result<T>
{
    error_guard(node, DEFAULT_RETRIABLE, |n| {
        if reentrant {
            after(n, event, op)
        } else {
            before(n, event, true, op)
        }
    })
}
