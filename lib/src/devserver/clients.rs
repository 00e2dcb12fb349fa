use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::devserver::Reload;

struct Client {
    id: u64,
    tx: mpsc::Sender<Reload>,
}

/// The browsers currently connected to the dev server.
///
/// Clients are added on connect and removed the first time a send to them
/// fails, because they disconnected, or does not finish within the send
/// timeout.
pub struct Clients {
    next_id: AtomicU64,
    clients: Mutex<Vec<Client>>,
    send_timeout: Duration,
    buffer: usize,
}

impl Clients {
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

    const BUFFER: usize = 16;

    pub fn new(send_timeout: Duration) -> Self {
        Clients::with_buffer(send_timeout, Self::BUFFER)
    }

    /// Like [`Clients::new()`] with room for `buffer` undelivered reloads
    /// per client.
    pub fn with_buffer(send_timeout: Duration, buffer: usize) -> Self {
        Clients {
            next_id: AtomicU64::new(0),
            clients: Mutex::new(vec![]),
            send_timeout,
            buffer: buffer.max(1),
        }
    }

    /// Registers a client. It stays registered until a send to it fails,
    /// so dropping the receiver is how a client disconnects.
    pub fn connect(&self) -> (u64, mpsc::Receiver<Reload>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.clients.lock().push(Client { id, tx });
        (id, rx)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnects every client, ending their event streams.
    pub fn close_all(&self) {
        self.clients.lock().clear();
    }

    /// Sends `reload` to every client at once and returns how many got it.
    /// A client that is gone or slower than the send timeout is dropped;
    /// nobody else waits on it longer than that timeout.
    pub async fn broadcast(&self, reload: &Reload) -> usize {
        let targets: Vec<(u64, mpsc::Sender<Reload>)> = self.clients.lock()
            .iter()
            .map(|c| (c.id, c.tx.clone()))
            .collect();

        let sends = targets.iter().map(|(id, tx)| async move {
            let sent = tokio::time::timeout(self.send_timeout, tx.send(reload.clone())).await;
            match sent {
                Ok(Ok(())) => None,
                Ok(Err(_)) => {
                    tracing::debug!(client = id, "reload client disconnected");
                    Some(*id)
                }
                Err(_) => {
                    tracing::warn!(client = id, "reload client timed out; dropping it");
                    Some(*id)
                }
            }
        });

        let dropped: Vec<u64> = futures::future::join_all(sends).await
            .into_iter()
            .flatten()
            .collect();

        if !dropped.is_empty() {
            self.clients.lock().retain(|c| !dropped.contains(&c.id));
        }

        targets.len() - dropped.len()
    }
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients")
            .field("connected", &self.len())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl Default for Clients {
    fn default() -> Self {
        Clients::new(Self::DEFAULT_SEND_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dead_and_slow_clients_do_not_hold_up_others() {
        let clients = Clients::with_buffer(Duration::from_secs(2), 1);
        let (_, mut healthy) = clients.connect();
        let (_, slow) = clients.connect();
        let (_, dead) = clients.connect();
        drop(dead);

        let reload = Reload { paths: vec!["/index.html".into()], full: true };
        assert_eq!(clients.broadcast(&reload).await, 2);
        assert_eq!(clients.len(), 2);
        assert_eq!(healthy.recv().await.as_ref(), Some(&reload));

        // The slow client never reads, so its one-slot buffer is full.
        let start = Instant::now();
        assert_eq!(clients.broadcast(&reload).await, 1);
        assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(100));
        assert_eq!(clients.len(), 1);
        assert_eq!(healthy.recv().await, Some(reload));

        drop(slow);
        clients.close_all();
        assert!(clients.is_empty());
        assert_eq!(healthy.recv().await, None);
    }
}
