//! Pin and unpin handlers
//!
//! Pinning is accept-first: the requester's reply lands on its well-known
//! pin-accept port before the body is loaded, so a slow registry never holds
//! the scheduler's candidate search hostage.

use crate::server::{Executor, LoopAction};
use nimbus_fabric::Sender as _;
use nimbus_config::IsolationMode;
use nimbus_proto::messages::{GenericResponse, PinRequest, ResponseError};
use nimbus_proto::ports::pin_accept_address;
use nimbus_proto::to_bytes;

impl Executor {
    /// Pin `req.name`, replying on the requester's pin-accept port
    pub async fn handle_pin(&mut self, req: PinRequest) {
        let accept_addr = pin_accept_address(&req.response_address);

        let occupied = self.config.isolation == IsolationMode::Strong && !self.pinned.is_empty();
        if occupied || !self.status.running {
            if let Ok(bytes) = to_bytes(&GenericResponse::err(ResponseError::InvalidTarget)) {
                self.sender.send(&accept_addr, bytes);
            }
            return;
        }

        if self.status.functions.contains(&req.name) {
            // Already pinned here; accept idempotently.
            if let Ok(bytes) = to_bytes(&GenericResponse::ok()) {
                self.sender.send(&accept_addr, bytes);
            }
            return;
        }

        tracing::info!(function = %req.name, "pinning function");
        if let Ok(bytes) = to_bytes(&GenericResponse::ok()) {
            self.sender.send(&accept_addr, bytes);
        }

        // The function must exist for the DAG to have been registered, so
        // keep trying until the bounded retry window expires.
        match self.registry.retrieve_function(&req.name).await {
            Ok(body) => {
                self.status.functions.push(req.name.clone());
                self.pinned.insert(req.name.clone(), body);
                self.runtimes.insert(req.name.clone(), 0.0);
                self.exec_counts.insert(req.name, 0);
            }
            Err(err) => {
                tracing::warn!(function = %req.name, "pin abandoned, body unreadable: {err}");
            }
        }
    }

    /// Unpin `name` once nothing is in flight for it
    pub fn handle_unpin(&mut self, name: &str) -> LoopAction {
        tracing::info!(function = name, "unpinning function");

        // Strong isolation restarts the process to clear every cache.
        if self.config.isolation == IsolationMode::Strong {
            return LoopAction::Exit;
        }

        if !self.status.functions.iter().any(|f| f == name) {
            return LoopAction::Continue;
        }

        self.status.functions.retain(|f| f != name);

        let drained = self
            .queue
            .get(name)
            .map(|by_id| by_id.is_empty())
            .unwrap_or(true);
        if drained {
            self.queue.remove(name);
            self.received_triggers.remove(name);
            self.pinned.remove(name);
            self.runtimes.remove(name);
            self.exec_counts.remove(name);
        }

        LoopAction::Continue
    }
}
