//! Physical Topology
//!
//! Loads the microgrid graph from a whitespace-token file with two entry
//! kinds: `edge <sym> <sym>` and `sst <sym> <uuid>`. Duplicate edges are
//! idempotent; an unknown token aborts the load.

use crate::types::{Error, PeerId, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Undirected graph over vertex symbols plus the symbol-to-node map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    adjacency: BTreeMap<String, BTreeSet<String>>,
    symbols: BTreeMap<String, PeerId>,
}

impl Topology {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut topology = Topology::default();
        let mut tokens = input.split_whitespace();

        while let Some(token) = tokens.next() {
            match token {
                "edge" => {
                    let (a, b) = match (tokens.next(), tokens.next()) {
                        (Some(a), Some(b)) => (a.to_string(), b.to_string()),
                        _ => return Err(Error::Topology("truncated edge entry".into())),
                    };
                    debug!(a = %a, b = %b, "topology edge");
                    topology.adjacency.entry(a.clone()).or_default().insert(b.clone());
                    topology.adjacency.entry(b).or_default().insert(a);
                }
                "sst" => {
                    let (symbol, uuid) = match (tokens.next(), tokens.next()) {
                        (Some(s), Some(u)) => (s.to_string(), u.to_string()),
                        _ => return Err(Error::Topology("truncated sst entry".into())),
                    };
                    debug!(symbol = %symbol, uuid = %uuid, "topology vertex");
                    topology.symbols.insert(symbol, PeerId::new(uuid));
                }
                other => {
                    return Err(Error::Topology(format!("unexpected token: {}", other)));
                }
            }
        }

        Ok(topology)
    }

    /// Render back to the file format; parse of the output reproduces the
    /// same adjacency relation and symbol table.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (a, neighbors) in &self.adjacency {
            for b in neighbors {
                // Each undirected edge once.
                if a < b {
                    out.push_str(&format!("edge {} {}\n", a, b));
                }
            }
        }
        for (symbol, uuid) in &self.symbols {
            out.push_str(&format!("sst {} {}\n", symbol, uuid));
        }
        out
    }

    pub fn adjacency_of(&self, symbol: &str) -> BTreeSet<String> {
        self.adjacency.get(symbol).cloned().unwrap_or_default()
    }

    pub fn degree(&self, symbol: &str) -> usize {
        self.adjacency.get(symbol).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn max_degree(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).max().unwrap_or(0)
    }

    /// Consensus averaging step `1/(max degree + 1)`.
    pub fn epsilon(&self) -> f64 {
        1.0 / (self.max_degree() as f64 + 1.0)
    }

    pub fn peer_for(&self, symbol: &str) -> Option<&PeerId> {
        self.symbols.get(symbol)
    }

    pub fn symbol_for(&self, peer: &PeerId) -> Option<&str> {
        self.symbols
            .iter()
            .find(|(_, uuid)| *uuid == peer)
            .map(|(symbol, _)| symbol.as_str())
    }

    pub fn vertex_count(&self) -> usize {
        self.adjacency.len()
    }
}
