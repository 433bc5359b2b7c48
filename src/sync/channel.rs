// Transport seam for the controller <-> robot link
//
// A `Transport` knows how to (re)open a link; a `Link` moves opaque payloads
// (JSON text) both ways. The sync loops own retry, backoff and decoding, so a
// transport only has to report failures honestly.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Channel closed by peer")]
    Closed,
}

/// One open, bidirectional link. Shared between the receive loop and senders.
pub trait Link: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Next inbound payload; `Ok(None)` once the peer has closed the link.
    /// Must be cancel-safe: it is polled under a timeout.
    fn recv(&self) -> impl Future<Output = Result<Option<Vec<u8>>, ChannelError>> + Send;
}

/// Factory for links, called again after every failure
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    fn connect(&self) -> impl Future<Output = Result<Self::Link, ChannelError>> + Send;
}

/// In-process transport over tokio channels, one end per side.
/// Used by tests and by the teleop binary's `--sim` mode.
pub mod memory {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        tx: mpsc::Sender<Vec<u8>>,
        rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    }

    /// Two connected ends, e.g. `(controller, robot)`
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            MemoryTransport {
                tx: a_tx,
                rx: Arc::new(Mutex::new(a_rx)),
            },
            MemoryTransport {
                tx: b_tx,
                rx: Arc::new(Mutex::new(b_rx)),
            },
        )
    }

    #[derive(Debug)]
    pub struct MemoryLink {
        tx: mpsc::Sender<Vec<u8>>,
        rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    }

    impl Transport for MemoryTransport {
        type Link = MemoryLink;

        async fn connect(&self) -> Result<MemoryLink, ChannelError> {
            if self.tx.is_closed() {
                return Err(ChannelError::Connect("peer gone".into()));
            }
            Ok(MemoryLink {
                tx: self.tx.clone(),
                rx: self.rx.clone(),
            })
        }
    }

    impl Link for MemoryLink {
        async fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
            self.tx.send(payload).await.map_err(|_| ChannelError::Closed)
        }

        async fn recv(&self) -> Result<Option<Vec<u8>>, ChannelError> {
            Ok(self.rx.lock().await.recv().await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::pair;
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_is_bidirectional() {
        let (a, b) = pair(8);
        let a = a.connect().await.unwrap();
        let b = b.connect().await.unwrap();

        a.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));
        b.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_link() {
        let (a, b) = pair(8);
        let link = a.connect().await.unwrap();
        drop(b);

        assert_eq!(link.recv().await, Ok(None));
        assert_eq!(link.send(b"x".to_vec()).await, Err(ChannelError::Closed));
        assert!(matches!(a.connect().await, Err(ChannelError::Connect(_))));
    }
}
