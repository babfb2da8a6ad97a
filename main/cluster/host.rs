//! A single compute node: fixed socket geometry, per-socket free cores, and
//! the processors each resident job holds.

use procset::ProcSet;
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Busy,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub state: HostState,
    /// Fixed processor IDs of each socket, assigned at cluster setup.
    spans: Vec<ProcSet>,
    /// Currently free processor IDs of each socket.
    pub sockets: Vec<ProcSet>,
    /// Processors held on this host, keyed by job signature.
    pub jobs: BTreeMap<String, ProcSet>,
}

impl Host {
    pub fn new(name: impl Into<String>, spans: Vec<ProcSet>) -> Self {
        Self {
            name: name.into(),
            state: HostState::Idle,
            sockets: spans.clone(),
            spans,
            jobs: BTreeMap::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All processor IDs owned by this host.
    pub fn span(&self) -> ProcSet {
        self.spans
            .iter()
            .fold(ProcSet::new(), |acc, s| &acc | s)
    }

    /// The fixed processor IDs of socket `i`.
    pub fn socket_span(&self, i: usize) -> &ProcSet {
        &self.spans[i]
    }

    pub fn free_cores(&self) -> u32 {
        self.sockets.iter().map(ProcSet::len).sum()
    }

    /// Record that `sig` now holds `cores` on this host. The cores must be
    /// free here.
    pub fn reserve(&mut self, sig: &str, cores: &ProcSet) {
        for (i, socket) in self.sockets.iter_mut().enumerate() {
            let part = &self.spans[i] & cores;
            debug_assert!(socket.is_superset(&part));
            *socket -= &part;
        }
        let held = self.jobs.entry(sig.to_string()).or_default();
        *held |= cores;
        self.state = HostState::Busy;
    }

    /// Return `cores` held by `sig` to the free pool of their sockets.
    pub fn release(&mut self, sig: &str, cores: &ProcSet) {
        if let Some(held) = self.jobs.get_mut(sig) {
            debug_assert!(held.is_superset(cores));
            *held -= cores;
            if held.is_empty() {
                self.jobs.remove(sig);
            }
        }
        for (i, socket) in self.sockets.iter_mut().enumerate() {
            *socket |= &(&self.spans[i] & cores);
        }
        if self.jobs.is_empty() {
            self.state = HostState::Idle;
        }
    }

    /// Move `cores` from one resident signature to another without touching
    /// the free pool. Used when a job takes over part of an idle
    /// reservation.
    pub fn transfer(&mut self, from_sig: &str, cores: &ProcSet, to_sig: &str) {
        if let Some(held) = self.jobs.get_mut(from_sig) {
            debug_assert!(held.is_superset(cores));
            *held -= cores;
            if held.is_empty() {
                self.jobs.remove(from_sig);
            }
        }
        let held = self.jobs.entry(to_sig.to_string()).or_default();
        *held |= cores;
    }
}
