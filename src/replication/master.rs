//! Master side (C6): tracks replica sockets and mirrors write command
//! bytes to each of them, in commit order, without letting a slow replica
//! block the client connection that originated the write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};

struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Process-wide registry of connected replicas (entity `ReplicaLink`).
#[derive(Default)]
pub struct ReplicaRegistry {
    links: Mutex<Vec<Link>>,
    next_id: AtomicU64,
}

impl ReplicaRegistry {
    pub fn new() -> Arc<ReplicaRegistry> {
        Arc::new(ReplicaRegistry::default())
    }

    /// Registers `write_half` as a replica link once it has completed
    /// PSYNC, and spawns the task that drains queued writes to its socket.
    /// A write failure drops the link out of the registry by ending the
    /// task and the channel.
    pub async fn register(self: &Arc<Self>, mut write_half: OwnedWriteHalf) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut links = self.links.lock().await;
            links.push(Link { id, tx });
        }
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            registry.drop_link(id).await;
        });
    }

    async fn drop_link(&self, id: u64) {
        let mut links = self.links.lock().await;
        links.retain(|l| l.id != id);
    }

    /// Forwards `raw` to every currently registered replica. Best-effort
    /// and non-blocking: queuing onto a dead replica's channel is a no-op
    /// (its drain task has already exited and will reap the entry).
    pub async fn mirror(&self, raw: &[u8]) {
        let links = self.links.lock().await;
        for link in links.iter() {
            let _ = link.tx.send(raw.to_vec());
        }
    }

    pub async fn count(&self) -> usize {
        self.links.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn mirrors_bytes_to_registered_replica() {
        let (server_side, mut client_side) = loopback_pair().await;
        let (_read, write) = server_side.into_split();
        let registry = ReplicaRegistry::new();
        registry.register(write).await;
        assert_eq!(registry.count().await, 1);

        registry.mirror(b"*1\r\n$4\r\nPING\r\n").await;

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 32];
        let n = client_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
    }
}
