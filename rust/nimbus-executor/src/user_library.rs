//! User-function library
//!
//! The per-invocation handle passed to user code as an implicit first
//! argument: KVS get/put (plain and causal), the thread's identity, and a
//! send/recv mailbox between co-executing functions. A background task binds
//! the thread's user-mailbox port and feeds a thread-safe unbounded inbox;
//! `recv` drains and never blocks.

use crate::{ExecutorError, ExecutorResult};
use nimbus_fabric::{bind_pull, Sender, SocketCache};
use nimbus_kvs::{get_one_with_retry, CausalGetResult, KvsClient, LwwPair};
use nimbus_proto::messages::{CausalLevel, UserMessage, VectorClock, VersionedKey};
use nimbus_proto::ports::user_mailbox_address;
use nimbus_proto::{from_bytes, to_bytes};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle exposed to user functions
pub struct UserLibrary {
    ip: String,
    tid: u32,
    kvs: Arc<dyn KvsClient>,
    sender: Arc<dyn Sender>,
    inbox: Arc<Mutex<VecDeque<UserMessage>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UserLibrary {
    /// Bind the mailbox port and start the background listener
    pub async fn bind(
        ip: impl Into<String>,
        tid: u32,
        kvs: Arc<dyn KvsClient>,
        sender: Arc<dyn Sender>,
    ) -> ExecutorResult<Arc<Self>> {
        let ip = ip.into();
        let inbox = Arc::new(Mutex::new(VecDeque::new()));

        let mut rx = bind_pull(&nimbus_proto::ports::bind_address(
            nimbus_proto::ports::USER_MAILBOX_PORT + tid as u16,
        ))
        .await?;

        let inbox_feed = inbox.clone();
        let listener = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match from_bytes::<UserMessage>(&frame) {
                    Ok(msg) => inbox_feed.lock().push_back(msg),
                    Err(err) => tracing::debug!("dropping malformed user message: {err}"),
                }
            }
        });

        Ok(Arc::new(UserLibrary {
            ip,
            tid,
            kvs,
            sender,
            inbox,
            listener: Mutex::new(Some(listener)),
        }))
    }

    /// A library with no bound mailbox, over an in-memory KVS; used by tests
    /// and invoker setup that never touches the network
    pub fn detached() -> Arc<Self> {
        Arc::new(UserLibrary {
            ip: "127.0.0.1".to_string(),
            tid: 0,
            kvs: Arc::new(nimbus_kvs::MemoryKvs::new()),
            sender: Arc::new(SocketCache::new()),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            listener: Mutex::new(None),
        })
    }

    /// A library sharing the executor's KVS and sender, without a mailbox
    /// listener
    pub fn with_parts(
        ip: impl Into<String>,
        tid: u32,
        kvs: Arc<dyn KvsClient>,
        sender: Arc<dyn Sender>,
    ) -> Arc<Self> {
        Arc::new(UserLibrary {
            ip: ip.into(),
            tid,
            kvs,
            sender,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            listener: Mutex::new(None),
        })
    }

    /// Store `value` at `key`
    pub async fn put(&self, key: &str, value: Vec<u8>) -> ExecutorResult<()> {
        self.kvs
            .put(key, LwwPair::now(self.tid, value))
            .await
            .map_err(ExecutorError::from)
    }

    /// Read `key`, retrying until present within the bounded retry window
    pub async fn get(&self, key: &str) -> ExecutorResult<Vec<u8>> {
        Ok(get_one_with_retry(self.kvs.as_ref(), key).await?.value)
    }

    /// Causal put with explicit metadata
    pub async fn causal_put(
        &self,
        key: &str,
        vector_clock: VectorClock,
        deps: Vec<VersionedKey>,
        value: Vec<u8>,
        client_id: &str,
    ) -> ExecutorResult<bool> {
        self.kvs
            .causal_put(key, vector_clock, deps, value, client_id)
            .await
            .map_err(ExecutorError::from)
    }

    /// Causal get at cross-key level
    pub async fn causal_get(&self, key: &str, client_id: &str) -> ExecutorResult<CausalGetResult> {
        self.kvs
            .causal_get(&[key.to_string()], &[], CausalLevel::Cross, client_id)
            .await
            .map_err(ExecutorError::from)
    }

    /// This executor thread's `(ip, tid)`
    pub fn get_id(&self) -> (String, u32) {
        (self.ip.clone(), self.tid)
    }

    /// Push a message to another executor thread's mailbox; non-blocking
    pub fn send(&self, dest: (&str, u32), payload: Vec<u8>) -> ExecutorResult<()> {
        let msg = UserMessage {
            sender_ip: self.ip.clone(),
            sender_tid: self.tid,
            payload,
        };
        self.sender
            .send(&user_mailbox_address(dest.0, dest.1), to_bytes(&msg)?);
        Ok(())
    }

    /// Drain the inbox; never blocks
    pub fn recv(&self) -> Vec<UserMessage> {
        self.inbox.lock().drain(..).collect()
    }

    /// Stop the background listener, if one is running
    pub fn close(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for UserLibrary {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_fabric::testing::RecordingSender;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let library = UserLibrary::detached();
        library.put("k", b"payload".to_vec()).await.unwrap();
        assert_eq!(library.get("k").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_send_targets_dest_mailbox_port() {
        let recorder = Arc::new(RecordingSender::new());
        let library = UserLibrary::with_parts(
            "10.0.0.1",
            1,
            Arc::new(nimbus_kvs::MemoryKvs::new()),
            recorder.clone(),
        );

        library.send(("10.0.0.2", 2), b"hello".to_vec()).unwrap();

        let sent: Vec<UserMessage> = recorder.decoded_to("10.0.0.2:5502");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sender_ip, "10.0.0.1");
        assert_eq!(sent[0].sender_tid, 1);
        assert_eq!(sent[0].payload, b"hello");
    }

    #[tokio::test]
    async fn test_recv_drains_and_never_blocks() {
        let library = UserLibrary::detached();
        assert!(library.recv().is_empty());

        library.inbox.lock().push_back(UserMessage {
            sender_ip: "10.0.0.3".to_string(),
            sender_tid: 0,
            payload: b"m".to_vec(),
        });

        assert_eq!(library.recv().len(), 1);
        assert!(library.recv().is_empty());
    }

    #[tokio::test]
    async fn test_mailbox_listener_feeds_inbox() {
        // Use a tid that lands the mailbox on a likely-free port.
        let tid = 399;
        let library = UserLibrary::bind(
            "127.0.0.1",
            tid,
            Arc::new(nimbus_kvs::MemoryKvs::new()),
            Arc::new(SocketCache::new()),
        )
        .await
        .unwrap();

        let peer = UserLibrary::with_parts(
            "127.0.0.1",
            0,
            Arc::new(nimbus_kvs::MemoryKvs::new()),
            Arc::new(SocketCache::new()),
        );
        peer.send(("127.0.0.1", tid), b"ping".to_vec()).unwrap();

        // Give the push channel a moment to connect and deliver.
        for _ in 0..50 {
            if !library.inbox.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let messages = library.recv();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"ping");
        library.close();
    }
}
