//! Utility functions for HyperRoute

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::graph::EdgeIndex;
use crate::Result;

/// Save object to JSON file
pub fn save_json<T: Serialize, P: AsRef<Path>>(obj: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(obj)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Load object from JSON file
pub fn load_json<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> Result<T> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let obj = serde_json::from_str(&contents)?;
    Ok(obj)
}

/// Generate a random road network: a two-way ring plus `shortcuts` random one-way streets
pub fn random_road_network<R: Rng>(num_nodes: usize, shortcuts: usize, rng: &mut R) -> DiGraph<(), ()> {
    let mut graph = DiGraph::with_capacity(num_nodes, 2 * num_nodes + shortcuts);
    let nodes: Vec<NodeIndex> = (0..num_nodes).map(|_| graph.add_node(())).collect();
    if num_nodes < 2 {
        return graph;
    }

    for i in 0..num_nodes {
        let next = (i + 1) % num_nodes;
        graph.add_edge(nodes[i], nodes[next], ());
        graph.add_edge(nodes[next], nodes[i], ());
    }
    for _ in 0..shortcuts {
        let a = rng.gen_range(0..num_nodes);
        let b = rng.gen_range(0..num_nodes);
        if a != b {
            graph.add_edge(nodes[a], nodes[b], ());
        }
    }
    graph
}

/// Random walks along `edges`, each of 2 to `max_len` nodes
///
/// A walk stops early at a node without outgoing edges.
pub fn random_walks<R: Rng>(
    edges: &EdgeIndex,
    num_nodes: usize,
    num_walks: usize,
    max_len: usize,
    rng: &mut R,
) -> Vec<Vec<u32>> {
    let mut neighbours = vec![Vec::new(); num_nodes];
    for (s, d) in edges.iter() {
        neighbours[s].push(d);
    }
    if num_nodes == 0 {
        return Vec::new();
    }

    (0..num_walks)
        .map(|_| {
            let len = rng.gen_range(2..=max_len.max(2));
            let mut node = rng.gen_range(0..num_nodes);
            let mut walk = vec![node as u32];
            while walk.len() < len {
                let Some(&next) = neighbours[node].choose(rng) else {
                    break;
                };
                node = next;
                walk.push(node as u32);
            }
            walk
        })
        .collect()
}

/// Timing utilities
pub mod timing {
    use std::time::Instant;

    /// Simple timer, reported through `tracing` when dropped
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start new timer
        pub fn new(name: &str) -> Self {
            Timer {
                start: Instant::now(),
                name: name.to_string(),
            }
        }

        /// Get elapsed time
        pub fn elapsed(&self) -> f32 {
            self.start.elapsed().as_secs_f32()
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            tracing::info!(timer = %self.name, seconds = self.elapsed(), "elapsed");
        }
    }
}
