//! Least connections selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{endpoint::ModuleEndpoint, LoadBalancer};

/// Picks the endpoint with the fewest active connections.
///
/// Ties rotate round-robin across calls instead of always favouring the
/// first registered endpoint.
#[derive(Debug, Default)]
pub struct LeastConnections {
    tie_counter: AtomicUsize,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, candidates: &[Arc<ModuleEndpoint>]) -> Option<Arc<ModuleEndpoint>> {
        let min = candidates.iter().map(|ep| ep.active_conns()).min()?;

        let tied: Vec<&Arc<ModuleEndpoint>> = candidates
            .iter()
            .filter(|ep| ep.active_conns() == min)
            .collect();

        // Counts can move between the two scans.
        if tied.is_empty() {
            return candidates.iter().min_by_key(|ep| ep.active_conns()).cloned();
        }

        let turn = self.tie_counter.fetch_add(1, Ordering::Relaxed);
        Some(tied[turn % tied.len()].clone())
    }
}
