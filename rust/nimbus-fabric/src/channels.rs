//! Push/pull and request/reply channels
//!
//! Inbound endpoints accept any number of senders; frames from one sender
//! arrive in send order because each sender holds a single ordered stream.

use crate::{FabricError, FabricResult};
use nimbus_proto::codec::{read_frame, write_frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use std::time::Duration;

/// Bind a pull endpoint; every inbound frame lands on the returned receiver
pub async fn bind_pull(addr: &str) -> FabricResult<mpsc::UnboundedReceiver<Vec<u8>>> {
    let listener = TcpListener::bind(addr).await.map_err(|source| FabricError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                continue;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let (mut reader, _writer) = stream.into_split();
                loop {
                    match read_frame(&mut reader).await {
                        Ok(frame) => {
                            if tx.send(frame).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::trace!(%peer, "pull stream closed: {err}");
                            return;
                        }
                    }
                }
            });
        }
    });

    Ok(rx)
}

/// The reply side of one request/reply exchange
pub struct ReplyHandle {
    tx: oneshot::Sender<Vec<u8>>,
}

impl ReplyHandle {
    /// Send the reply frame; consumed on use
    pub fn send(self, payload: Vec<u8>) {
        // A dropped requester just means the reply has nowhere to go.
        let _ = self.tx.send(payload);
    }
}

/// Bind a reply endpoint; each inbound request arrives with its reply handle
pub async fn bind_rep(
    addr: &str,
) -> FabricResult<mpsc::UnboundedReceiver<(Vec<u8>, ReplyHandle)>> {
    let listener = TcpListener::bind(addr).await.map_err(|source| FabricError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, peer)) = listener.accept().await else {
                continue;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let frame = match read_frame(&mut stream).await {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::trace!(%peer, "rep stream closed: {err}");
                            return;
                        }
                    };

                    let (reply_tx, reply_rx) = oneshot::channel();
                    if tx.send((frame, ReplyHandle { tx: reply_tx })).is_err() {
                        return;
                    }

                    // The handler owns the pacing here; a dropped handle
                    // terminates the exchange.
                    let Ok(reply) = reply_rx.await else { return };
                    if write_frame(&mut stream, &reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    Ok(rx)
}

/// One synchronous request/reply exchange with a deadline
pub async fn request(addr: &str, payload: &[u8], timeout: Duration) -> FabricResult<Vec<u8>> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.map_err(|source| FabricError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        write_frame(&mut stream, payload).await?;
        let reply = read_frame(&mut stream).await?;
        Ok::<_, FabricError>(reply)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| FabricError::Timeout(timeout))?
}

/// Receive one frame from a pull receiver with a deadline
pub async fn recv_timeout(
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    timeout: Duration,
) -> FabricResult<Vec<u8>> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(FabricError::ChannelClosed("pull".to_string())),
        Err(_) => Err(FabricError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_cache::{Sender, SocketCache};

    async fn free_port_addr() -> String {
        // Bind to port 0 to reserve an ephemeral port, then reuse it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_push_pull_preserves_sender_order() {
        let addr = free_port_addr().await;
        let mut rx = bind_pull(&addr).await.unwrap();

        let cache = SocketCache::new();
        for i in 0..5u32 {
            cache.send(&addr, i.to_le_bytes().to_vec());
        }

        for i in 0..5u32 {
            let frame = recv_timeout(&mut rx, Duration::from_secs(5)).await.unwrap();
            assert_eq!(frame, i.to_le_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let addr = free_port_addr().await;
        let mut rx = bind_rep(&addr).await.unwrap();

        tokio::spawn(async move {
            while let Some((frame, reply)) = rx.recv().await {
                let mut echoed = frame;
                echoed.push(b'!');
                reply.send(echoed);
            }
        });

        let reply = request(&addr, b"ping", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, b"ping!");
    }

    #[tokio::test]
    async fn test_request_times_out_against_silent_peer() {
        let addr = free_port_addr().await;
        // A pull endpoint accepts the connection but never replies.
        let _rx = bind_pull(&addr).await.unwrap();

        let err = request(&addr, b"ping", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_push_to_absent_peer_is_best_effort() {
        let addr = free_port_addr().await;
        let cache = SocketCache::new();
        // Nothing is listening; the send must not panic or block.
        cache.send(&addr, b"dropped".to_vec());
    }
}
