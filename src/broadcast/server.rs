//! TCP fan-out of ERD results

use crate::error::{ErdError, Result};
use crate::types::ErdResult;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the accept thread checks the running flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A stuck consumer socket is abandoned after this long
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

struct Consumer {
    id: u64,
    peer: SocketAddr,
    tx: Sender<Arc<str>>,
    alive: Arc<AtomicBool>,
    socket: Option<TcpStream>,
    writer: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Close the queue so the writer flushes what is left and exits.
    fn release(self) -> (Option<JoinHandle<()>>, Option<TcpStream>) {
        let Consumer {
            tx, writer, socket, ..
        } = self;
        drop(tx);
        (writer, socket)
    }
}

struct Shared {
    consumers: Mutex<Vec<Consumer>>,
    queue_capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn consumers(&self) -> MutexGuard<'_, Vec<Consumer>> {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let socket = stream.try_clone()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<Arc<str>>(self.queue_capacity);
        let alive = Arc::new(AtomicBool::new(true));
        let writer_alive = alive.clone();

        let writer = std::thread::Builder::new()
            .name(format!("consumer-{id}"))
            .spawn(move || {
                let mut stream = stream;
                for line in rx.iter() {
                    if let Err(e) = stream.write_all(line.as_bytes()) {
                        tracing::debug!("Consumer {} ({}) write failed: {}", id, peer, e);
                        break;
                    }
                }
                writer_alive.store(false, Ordering::Relaxed);
                let _ = stream.shutdown(Shutdown::Both);
            })?;

        // Registration and broadcast share the lock, so a new consumer only
        // sees results broadcast after this point.
        self.consumers().push(Consumer {
            id,
            peer,
            tx,
            alive,
            socket: Some(socket),
            writer: Some(writer),
        });
        tracing::info!("Consumer {} connected from {}", id, peer);
        Ok(())
    }
}

/// Accepts consumers and pushes each result to all of them as one JSON line.
///
/// Each consumer has its own writer thread and bounded queue. A consumer
/// whose queue is full is disconnected on the spot rather than slowing the
/// computation loop.
pub struct BroadcastServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    sent: u64,
}

impl BroadcastServer {
    /// Bind to `host:port` and start accepting consumers. Port 0 picks a free port.
    pub fn bind(host: &str, port: u16, queue_capacity: usize) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).map_err(|e| {
            ErdError::Broadcast(format!("Failed to bind {}:{}: {}", host, port, e))
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            consumers: Mutex::new(Vec::new()),
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        });
        let running = Arc::new(AtomicBool::new(true));

        let accept_shared = shared.clone();
        let accept_running = running.clone();
        let accept_handle = std::thread::Builder::new()
            .name("broadcast-accept".into())
            .spawn(move || accept_loop(listener, accept_shared, accept_running))?;

        tracing::info!("Broadcasting results on {}", local_addr);
        Ok(Self {
            local_addr,
            shared,
            running,
            accept_handle: Some(accept_handle),
            sent: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Currently registered consumers
    pub fn consumer_count(&self) -> usize {
        self.shared
            .consumers()
            .iter()
            .filter(|c| c.alive.load(Ordering::Relaxed))
            .count()
    }

    /// Consumers disconnected because they fell behind
    pub fn dropped_consumers(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Results broadcast so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Serialize `result` once and queue it for every consumer.
    ///
    /// Returns how many consumers it was queued for.
    pub fn broadcast(&mut self, result: &ErdResult) -> Result<usize> {
        let mut line = serde_json::to_string(result)
            .map_err(|e| ErdError::Serialization(e.to_string()))?;
        line.push('\n');
        let line: Arc<str> = Arc::from(line);
        self.sent += 1;

        let mut consumers = self.shared.consumers();
        let mut delivered = 0;
        let mut removed = Vec::new();
        let mut i = 0;
        while i < consumers.len() {
            let consumer = &consumers[i];
            let keep = if !consumer.alive.load(Ordering::Relaxed) {
                tracing::debug!("Consumer {} ({}) went away", consumer.id, consumer.peer);
                false
            } else {
                match consumer.tx.try_send(line.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(
                            "Consumer {} ({}) is too slow, disconnecting",
                            consumer.id,
                            consumer.peer
                        );
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                }
            };
            if keep {
                i += 1;
            } else {
                removed.push(consumers.swap_remove(i));
            }
        }
        drop(consumers);

        // Writer threads are detached here; a closed socket ends them promptly.
        for mut consumer in removed {
            if let Some(socket) = consumer.socket.take() {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
        Ok(delivered)
    }

    /// Stop accepting and close every consumer connection.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let consumers: Vec<Consumer> = self.shared.consumers().drain(..).collect();
        let count = consumers.len();
        // Every writer drains concurrently; waiting is bounded by the slowest one
        let released: Vec<_> = consumers.into_iter().map(Consumer::release).collect();
        for (writer, socket) in released {
            if let Some(writer) = writer {
                let _ = writer.join();
            }
            if let Some(socket) = socket {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
        tracing::info!("Broadcast server closed ({} consumers disconnected)", count);
    }

    #[cfg(test)]
    fn attach_queue(&self, capacity: usize) -> crossbeam_channel::Receiver<Arc<str>> {
        let (tx, rx) = bounded(capacity);
        self.shared.consumers().push(Consumer {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            peer: self.local_addr,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
            socket: None,
            writer: None,
        });
        rx
    }

    /// Consumer whose writer takes `linger` to finish after its queue closes.
    #[cfg(test)]
    fn attach_lingering_writer(&self, linger: Duration) {
        let (tx, rx) = bounded::<Arc<str>>(4);
        let writer = std::thread::spawn(move || {
            for _ in rx.iter() {}
            std::thread::sleep(linger);
        });
        self.shared.consumers().push(Consumer {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            peer: self.local_addr,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
            socket: None,
            writer: Some(writer),
        });
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = shared.register(stream, peer) {
                    tracing::warn!("Failed to register consumer {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}
