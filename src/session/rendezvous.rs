//! Reverse-connect session: advertise over broadcast UDP until peers dial
//! back into our TCP listener, then exchange lines with every peer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::line::{PumpExit, Response, pump};
use super::{Result, SessionError, SessionErrorKind, SessionEvent, SessionObserver, stop_task};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RendezvousSettings {
    /// TCP address peers dial back into
    pub listen: SocketAddr,
    /// `host:port` the advertisement is sent to
    pub advertise_to: String,
    pub advertisement: String,
    pub advertise_interval: Duration,
    pub teardown_wait: Duration,
}

#[derive(Default)]
struct Peers {
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    wake: Notify,
}

impl Peers {
    fn senders(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<String>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, sender: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders().insert(id, sender);
        id
    }

    fn remove(&self, id: u64) {
        self.senders().remove(&id);
    }

    fn count(&self) -> usize {
        self.senders().len()
    }
}

/// Cloneable fan-out handle to every connected peer.
#[derive(Clone)]
pub struct RendezvousSender {
    peers: Arc<Peers>,
}

impl RendezvousSender {
    /// Send one line to all peers. With nobody connected the message is
    /// dropped and an advertisement goes out immediately.
    pub fn send(&self, message: &str) -> Result<usize> {
        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let delivered = {
            let mut senders = self.peers.senders();
            senders.retain(|_, tx| tx.send(line.clone()).is_ok());
            senders.len()
        };
        if delivered == 0 {
            self.peers.wake.notify_one();
            return Err(SessionError::NoPeers);
        }
        Ok(delivered)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.count()
    }
}

pub struct RendezvousSession {
    sender: RendezvousSender,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    teardown_wait: Duration,
}

impl RendezvousSession {
    pub async fn open(
        settings: RendezvousSettings,
        observer: Arc<dyn SessionObserver<Response>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(settings.listen).await?;
        let local_addr = listener.local_addr()?;
        let udp = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        udp.set_broadcast(true)?;

        info!(%local_addr, advertise_to = %settings.advertise_to, "Waiting for peers");

        let peers = Arc::new(Peers::default());
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(accept_loop(listener, peers.clone(), observer, cancel.clone())),
            tokio::spawn(advertise_loop(udp, settings.clone(), peers.clone(), cancel.clone())),
        ];

        Ok(Self {
            sender: RendezvousSender { peers },
            local_addr,
            cancel,
            tasks,
            teardown_wait: settings.teardown_wait,
        })
    }

    pub fn sender(&self) -> RendezvousSender {
        self.sender.clone()
    }

    pub fn send(&self, message: &str) -> Result<usize> {
        self.sender.send(message)
    }

    pub fn peer_count(&self) -> usize {
        self.sender.peer_count()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            stop_task(&self.cancel, Some(task), self.teardown_wait).await;
        }
    }
}

impl Drop for RendezvousSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<Peers>,
    observer: Arc<dyn SessionObserver<Response>>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let id = peers.add(tx);
                    info!(%addr, peers = peers.count(), "Peer connected");
                    observer.on_event(SessionEvent::Connected);

                    let peers = peers.clone();
                    let observer = observer.clone();
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        let exit = pump(stream, observer.as_ref(), &mut rx, &cancel).await;
                        peers.remove(id);
                        match exit {
                            PumpExit::Cancelled => {}
                            PumpExit::Closed => {
                                info!(%addr, "Peer disconnected");
                                observer.on_event(SessionEvent::Disconnected("Peer closed".to_string()));
                            }
                            PumpExit::Failed(kind, message) => {
                                warn!(%addr, %kind, %message, "Peer connection failed");
                                observer.on_event(SessionEvent::Disconnected(kind.to_string()));
                            }
                        }
                    });
                }
                Err(err) => {
                    let kind = SessionErrorKind::classify(&err);
                    warn!(%kind, error = %err, "Accept failed");
                    observer.on_event(SessionEvent::Error(kind, err.to_string()));
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
    debug!("Rendezvous accept loop stopped");
}

async fn advertise_loop(
    udp: UdpSocket,
    settings: RendezvousSettings,
    peers: Arc<Peers>,
    cancel: CancellationToken,
) {
    loop {
        if peers.count() == 0 {
            match udp
                .send_to(settings.advertisement.as_bytes(), settings.advertise_to.as_str())
                .await
            {
                Ok(_) => debug!(to = %settings.advertise_to, "Advertisement sent"),
                Err(err) => warn!(to = %settings.advertise_to, error = %err, "Advertisement failed"),
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.advertise_interval) => {}
            _ = peers.wake.notified() => {}
        }
    }
    debug!("Rendezvous advertiser stopped");
}
