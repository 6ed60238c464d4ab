// Archivo: engine.rs
// Propósito: tabla de transiciones inmutable y su ejecutor puro `apply`.
//
// Nota: el ejecutor no persiste ni bloquea nada; el agregado del nodo es
// quien decide cuándo hacer commit del estado resultante.
use crate::domain::{NodeEvent, NodeState};
use crate::errors::{NodeError, Result};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hash;

/// Requisitos de un símbolo (estado o evento) de la tabla.
pub trait FsmSymbol: Copy + Eq + Hash + Ord + fmt::Display + fmt::Debug {}

impl<T> FsmSymbol for T where T: Copy + Eq + Hash + Ord + fmt::Display + fmt::Debug {}

/// Arista declarada `(from, event) -> to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition<S, E> {
    pub from: S,
    pub event: E,
    pub to: S,
}

/// Forma serializable de la tabla (configuración JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec<S, E> {
    /// Estado terminal al que se fuerza un nodo cuando algo falla.
    pub error_state: S,
    /// Evento que lleva a `error_state` desde cualquier estado no terminal.
    pub error_event: E,
    pub terminal: Vec<S>,
    pub transitions: Vec<Transition<S, E>>,
}

/// Tabla de transiciones: estados, eventos y aristas legales.
///
/// Es un valor puro; se comparte entre agregados detrás de un `Arc` y
/// nunca se muta después de construida.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionTable<S, E> {
    states: BTreeSet<S>,
    events: BTreeSet<E>,
    edges: BTreeMap<(S, E), S>,
    terminal: BTreeSet<S>,
    error_state: S,
    error_event: E,
}

/// Tabla concreta usada por las operaciones de ciclo de vida.
pub type NodeTransitions = TransitionTable<NodeState, NodeEvent>;

impl<S: FsmSymbol, E: FsmSymbol> TransitionTable<S, E> {
    /// Construye y valida una tabla a partir de su forma declarativa.
    ///
    /// Falla si el estado de error no es terminal o si algún estado no
    /// terminal no tiene arista para el evento de error.
    pub fn from_spec(spec: TransitionSpec<S, E>) -> Result<Self> {
        let table = Self::assemble(spec);
        table.validate()?;
        Ok(table)
    }

    fn assemble(spec: TransitionSpec<S, E>) -> Self {
        let mut states = BTreeSet::new();
        let mut events = BTreeSet::new();
        let mut edges = BTreeMap::new();
        for t in spec.transitions {
            states.insert(t.from);
            states.insert(t.to);
            events.insert(t.event);
            edges.insert((t.from, t.event), t.to);
        }
        let terminal: BTreeSet<S> = spec.terminal.into_iter().collect();
        states.extend(terminal.iter().copied());
        states.insert(spec.error_state);
        events.insert(spec.error_event);
        Self { states,
               events,
               edges,
               terminal,
               error_state: spec.error_state,
               error_event: spec.error_event }
    }

    fn validate(&self) -> Result<()> {
        if !self.terminal.contains(&self.error_state) {
            return Err(NodeError::error(format!("tabla de transiciones inválida: el estado de error \"{}\" no es terminal",
                                                self.error_state)));
        }
        for s in self.states.iter().filter(|s| !self.terminal.contains(s)) {
            if !self.edges.contains_key(&(*s, self.error_event)) {
                return Err(NodeError::error(format!("tabla de transiciones inválida: falta \"{}\" desde \"{}\"",
                                                    self.error_event, s)));
            }
        }
        Ok(())
    }

    /// Ejecutor puro: siguiente estado para `(state, event)` o
    /// `NodeError::InvalidEvent` si la arista no existe.
    pub fn apply(&self, state: S, event: E) -> Result<S> {
        self.edges
            .get(&(state, event))
            .copied()
            .ok_or_else(|| NodeError::InvalidEvent { state: state.to_string(),
                                                     event: event.to_string() })
    }

    pub fn can_apply(&self, state: S, event: E) -> bool {
        self.edges.contains_key(&(state, event))
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    pub fn error_state(&self) -> S {
        self.error_state
    }

    pub fn error_event(&self) -> E {
        self.error_event
    }

    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.states.iter().copied()
    }

    pub fn events(&self) -> impl Iterator<Item = E> + '_ {
        self.events.iter().copied()
    }

    /// Aristas en orden determinista `(from, event)`.
    pub fn transitions(&self) -> impl Iterator<Item = Transition<S, E>> + '_ {
        self.edges.iter().map(|((from, event), to)| Transition { from: *from,
                                                                  event: *event,
                                                                  to: *to })
    }

    pub fn to_spec(&self) -> TransitionSpec<S, E> {
        TransitionSpec { error_state: self.error_state,
                         error_event: self.error_event,
                         terminal: self.terminal.iter().copied().collect(),
                         transitions: self.transitions().collect() }
    }
}

impl<S, E> TransitionTable<S, E> where S: FsmSymbol + DeserializeOwned,
                                       E: FsmSymbol + DeserializeOwned
{
    /// Carga una tabla desde JSON (`TransitionSpec`).
    pub fn from_json(raw: &str) -> Result<Self> {
        let spec: TransitionSpec<S, E> = serde_json::from_str(raw)?;
        Self::from_spec(spec)
    }
}

impl<S, E> TransitionTable<S, E> where S: FsmSymbol + Serialize,
                                       E: FsmSymbol + Serialize
{
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_spec())?)
    }
}

static INTROSPECTION: Lazy<NodeTransitions> = Lazy::new(|| {
    use NodeEvent as E;
    use NodeState as S;
    let edges = [// starting
                 (S::Starting, E::Start, S::Starting),
                 (S::Starting, E::Wait, S::Waiting),
                 (S::Starting, E::Abort, S::Error),
                 (S::Starting, E::Error, S::Error),
                 // enrolling
                 (S::Enrolling, E::Process, S::Processing),
                 (S::Enrolling, E::Timeout, S::Error),
                 (S::Enrolling, E::Error, S::Error),
                 // waiting
                 (S::Waiting, E::Start, S::Starting),
                 (S::Waiting, E::Process, S::Processing),
                 (S::Waiting, E::Timeout, S::Error),
                 (S::Waiting, E::Abort, S::Error),
                 (S::Waiting, E::Error, S::Error),
                 // processing
                 (S::Processing, E::Process, S::Processing),
                 (S::Processing, E::Finish, S::Finished),
                 (S::Processing, E::Error, S::Error),
                 // reapplying
                 (S::Reapplying, E::Reapply, S::Reapplying),
                 (S::Reapplying, E::Finish, S::Finished),
                 (S::Reapplying, E::Error, S::Error),
                 // finished
                 (S::Finished, E::Start, S::Starting),
                 (S::Finished, E::Reapply, S::Reapplying),
                 (S::Finished, E::Finish, S::Finished),
                 // error
                 (S::Error, E::Start, S::Starting),
                 (S::Error, E::Reapply, S::Reapplying),
                 (S::Error, E::Error, S::Error)];
    TransitionTable::assemble(TransitionSpec { error_state: S::Error,
                                               error_event: E::Error,
                                               terminal: vec![S::Finished, S::Error],
                                               transitions: edges.iter()
                                                                 .map(|(from, event, to)| Transition { from: *from,
                                                                                                       event: *event,
                                                                                                       to: *to })
                                                                 .collect() })
});

impl TransitionTable<NodeState, NodeEvent> {
    /// Tabla integrada del ciclo de vida de introspección.
    pub fn introspection() -> Self {
        INTROSPECTION.clone()
    }
}

impl Default for TransitionTable<NodeState, NodeEvent> {
    fn default() -> Self {
        Self::introspection()
    }
}
