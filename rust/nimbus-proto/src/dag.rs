//! DAG graph operations
//!
//! Sources, predecessors, reachability, and the validity contract: acyclic,
//! every referenced function present, every function appearing at least once.

use crate::messages::Dag;
use std::collections::HashSet;
use thiserror::Error;

/// Ways a submitted DAG can be malformed
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DagValidationError {
    /// A connection references a function not in the function list
    #[error("connection references unknown function {0}")]
    UnknownFunction(String),

    /// The connection set contains a cycle
    #[error("dag contains a cycle through {0}")]
    Cyclic(String),

    /// The DAG has no functions at all
    #[error("dag has no functions")]
    Empty,
}

impl Dag {
    /// Functions with no incoming edge; they receive the synthetic BEGIN
    /// trigger
    pub fn sources(&self) -> Vec<String> {
        let sinks: HashSet<&str> = self.connections.iter().map(|c| c.sink.as_str()).collect();
        self.functions
            .iter()
            .filter(|f| !sinks.contains(f.as_str()))
            .cloned()
            .collect()
    }

    /// Functions with an edge into `fname`
    pub fn predecessors(&self, fname: &str) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| c.sink == fname)
            .map(|c| c.source.clone())
            .collect()
    }

    /// Functions `fname` has an edge into
    pub fn successors(&self, fname: &str) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| c.source == fname)
            .map(|c| c.sink.clone())
            .collect()
    }

    /// True when `fname` has no outgoing edges
    pub fn is_sink(&self, fname: &str) -> bool {
        !self.connections.iter().any(|c| c.source == fname)
    }

    /// Every function reachable downstream of `fname`, excluding `fname`
    pub fn descendants(&self, fname: &str) -> HashSet<String> {
        let mut children = HashSet::new();
        let mut delta: HashSet<String> = [fname.to_string()].into_iter().collect();

        while !delta.is_empty() {
            let mut new_delta = HashSet::new();
            for conn in &self.connections {
                if delta.contains(&conn.source) && !children.contains(&conn.sink) {
                    children.insert(conn.sink.clone());
                    new_delta.insert(conn.sink.clone());
                }
            }
            delta = new_delta;
        }

        children
    }

    /// Check the DAG contract
    pub fn validate(&self) -> Result<(), DagValidationError> {
        if self.functions.is_empty() {
            return Err(DagValidationError::Empty);
        }

        let known: HashSet<&str> = self.functions.iter().map(String::as_str).collect();
        for conn in &self.connections {
            if !known.contains(conn.source.as_str()) {
                return Err(DagValidationError::UnknownFunction(conn.source.clone()));
            }
            if !known.contains(conn.sink.as_str()) {
                return Err(DagValidationError::UnknownFunction(conn.sink.clone()));
            }
        }

        // Kahn's algorithm; leftover nodes imply a cycle.
        let mut in_degree: std::collections::HashMap<&str, usize> =
            self.functions.iter().map(|f| (f.as_str(), 0)).collect();
        for conn in &self.connections {
            *in_degree.entry(conn.sink.as_str()).or_insert(0) += 1;
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(f, _)| *f)
            .collect();
        let mut visited = 0usize;

        while let Some(func) = ready.pop() {
            visited += 1;
            for conn in &self.connections {
                if conn.source == func {
                    let degree = in_degree.get_mut(conn.sink.as_str()).unwrap_or_else(|| {
                        unreachable!("connections were checked against the function list")
                    });
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(conn.sink.as_str());
                    }
                }
            }
        }

        if visited != self.functions.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(f, _)| f.to_string())
                .unwrap_or_default();
            return Err(DagValidationError::Cyclic(stuck));
        }

        Ok(())
    }
}
