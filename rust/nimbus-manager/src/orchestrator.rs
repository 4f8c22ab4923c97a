//! Orchestration interface
//!
//! The pod layer is an external collaborator; the manager only ever asks it
//! to add nodes of a kind, remove one by IP, and enumerate pods or nodes by
//! role. The production implementation relays to the provisioning endpoints;
//! tests use the recording mock.

use async_trait::async_trait;
use nimbus_fabric::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The `Add(kind, n)` / `Remove(kind, ip)` surface of the pod layer
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Provision `count` new nodes of `kind`
    async fn add_nodes(&self, kind: &str, count: usize);

    /// Tear down the node of `kind` at `ip`
    async fn remove_node(&self, kind: &str, ip: &str);

    /// IPs of running pods with the given role
    async fn pod_ips(&self, role: &str) -> Vec<String>;

    /// IPs of provisioned nodes with the given role
    async fn node_ips(&self, role: &str) -> Vec<String>;

    /// Container restart count of the pod at `ip`
    async fn restart_count(&self, ip: &str) -> u32;
}

/// Orchestrator that relays `kind:arg` strings to the provisioning endpoints
pub struct RelayOrchestrator {
    sender: Arc<dyn Sender>,
    add_addr: String,
    remove_addr: String,
}

impl RelayOrchestrator {
    pub fn new(
        sender: Arc<dyn Sender>,
        add_addr: impl Into<String>,
        remove_addr: impl Into<String>,
    ) -> Self {
        RelayOrchestrator {
            sender,
            add_addr: add_addr.into(),
            remove_addr: remove_addr.into(),
        }
    }
}

#[async_trait]
impl Orchestrator for RelayOrchestrator {
    async fn add_nodes(&self, kind: &str, count: usize) {
        let msg = format!("{kind}:{count}");
        if let Ok(bytes) = nimbus_proto::to_bytes(&msg) {
            self.sender.send(&self.add_addr, bytes);
        }
    }

    async fn remove_node(&self, kind: &str, ip: &str) {
        let msg = format!("{kind}:{ip}");
        if let Ok(bytes) = nimbus_proto::to_bytes(&msg) {
            self.sender.send(&self.remove_addr, bytes);
        }
    }

    async fn pod_ips(&self, _role: &str) -> Vec<String> {
        // The provisioning layer answers membership queries out of band.
        Vec::new()
    }

    async fn node_ips(&self, _role: &str) -> Vec<String> {
        Vec::new()
    }

    async fn restart_count(&self, _ip: &str) -> u32 {
        0
    }
}

/// Recording orchestrator for tests
#[derive(Default)]
pub struct MockOrchestrator {
    pub added: Mutex<Vec<(String, usize)>>,
    pub removed: Mutex<Vec<(String, String)>>,
    pub pods: Mutex<HashMap<String, Vec<String>>>,
    pub nodes: Mutex<HashMap<String, Vec<String>>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pods(&self, role: &str, ips: &[&str]) {
        self.pods
            .lock()
            .insert(role.to_string(), ips.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_nodes(&self, role: &str, ips: &[&str]) {
        self.nodes
            .lock()
            .insert(role.to_string(), ips.iter().map(|s| s.to_string()).collect());
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn add_nodes(&self, kind: &str, count: usize) {
        self.added.lock().push((kind.to_string(), count));
    }

    async fn remove_node(&self, kind: &str, ip: &str) {
        self.removed.lock().push((kind.to_string(), ip.to_string()));
    }

    async fn pod_ips(&self, role: &str) -> Vec<String> {
        self.pods.lock().get(role).cloned().unwrap_or_default()
    }

    async fn node_ips(&self, role: &str) -> Vec<String> {
        self.nodes.lock().get(role).cloned().unwrap_or_default()
    }

    async fn restart_count(&self, _ip: &str) -> u32 {
        0
    }
}
