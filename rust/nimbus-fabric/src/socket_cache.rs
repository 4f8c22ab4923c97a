//! Process-wide push socket cache
//!
//! Maps destination address strings to open send channels. Callers acquire
//! by address; the cache retains the channel for the process lifetime. Each
//! channel is a background writer task that lazily connects and writes
//! length-prefixed frames in submission order.

use dashmap::DashMap;
use nimbus_proto::codec::write_frame;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Fire-and-forget frame delivery, implemented by [`SocketCache`] in
/// production and by recording doubles in tests
pub trait Sender: Send + Sync {
    /// Queue one frame for `addr`; best-effort, never blocks
    fn send(&self, addr: &str, payload: Vec<u8>);
}

/// Handle to one cached push channel
#[derive(Clone)]
pub struct PushSocket {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PushSocket {
    fn spawn(addr: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            let mut stream: Option<TcpStream> = None;

            while let Some(frame) = rx.recv().await {
                if stream.is_none() {
                    match TcpStream::connect(&addr).await {
                        Ok(connected) => stream = Some(connected),
                        Err(err) => {
                            tracing::trace!(%addr, "push connect failed, dropping frame: {err}");
                            continue;
                        }
                    }
                }

                if let Some(live) = stream.as_mut() {
                    if let Err(err) = write_frame(live, &frame).await {
                        tracing::trace!(%addr, "push write failed, dropping frame: {err}");
                        stream = None;
                    }
                }
            }
        });

        PushSocket { tx }
    }

    /// Queue one frame; dropped if the writer task has exited
    pub fn push(&self, payload: Vec<u8>) {
        let _ = self.tx.send(payload);
    }
}

/// Address-keyed cache of push channels
#[derive(Clone, Default)]
pub struct SocketCache {
    sockets: Arc<DashMap<String, PushSocket>>,
}

impl SocketCache {
    /// Create an empty cache
    pub fn new() -> Self {
        SocketCache {
            sockets: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the channel for `addr`, opening it on first use
    pub fn get(&self, addr: &str) -> PushSocket {
        self.sockets
            .entry(addr.to_string())
            .or_insert_with(|| PushSocket::spawn(addr.to_string()))
            .clone()
    }
}

impl Sender for SocketCache {
    fn send(&self, addr: &str, payload: Vec<u8>) {
        self.get(addr).push(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_reuses_channel_per_address() {
        let cache = SocketCache::new();
        let first = cache.get("127.0.0.1:19999");
        let second = cache.get("127.0.0.1:19999");
        assert!(first.tx.same_channel(&second.tx));
        assert_eq!(cache.sockets.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_addresses_get_distinct_channels() {
        let cache = SocketCache::new();
        let a = cache.get("127.0.0.1:19998");
        let b = cache.get("127.0.0.1:19997");
        assert!(!a.tx.same_channel(&b.tx));
    }
}
