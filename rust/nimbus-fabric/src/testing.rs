//! Test doubles for the fabric
//!
//! A recording sender that captures pushed frames in submission order so
//! handler logic can be exercised without sockets.

use crate::socket_cache::Sender;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Captures every `(addr, frame)` pushed through it
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames pushed so far, in order
    pub fn frames(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }

    /// Frames addressed to `addr`, decoded as `T`
    pub fn decoded_to<T: DeserializeOwned>(&self, addr: &str) -> Vec<T> {
        self.sent
            .lock()
            .iter()
            .filter(|(a, _)| a == addr)
            .filter_map(|(_, frame)| nimbus_proto::from_bytes(frame).ok())
            .collect()
    }

    /// Addresses that received at least one frame, in first-send order
    pub fn addresses(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (addr, _) in self.sent.lock().iter() {
            if !seen.contains(addr) {
                seen.push(addr.clone());
            }
        }
        seen
    }

    /// Drop everything recorded so far
    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Sender for RecordingSender {
    fn send(&self, addr: &str, payload: Vec<u8>) {
        self.sent.lock().push((addr.to_string(), payload));
    }
}
