//! fixed-width bank of UDP sockets shared by all nameservers
//!
//! Outbound queries round-robin across the bank. Each socket runs its own
//! receive task that decodes replies and hands them to the owning
//! nameserver, found through the selector by source address. Sockets are
//! retired after a write quota or on a rotation tick; a retired socket
//! keeps receiving for a short grace period so in-flight replies are not
//! lost.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};

use super::errors::{ResolveError, Result};
use super::msgs::DEFAULT_MSG_SIZE;
use super::selectors::Selector;

/// Writes a socket serves before it is rotated out of the bank.
pub const MAX_WRITES: usize = 50;

/// Deadline for one UDP send.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);

const ROTATION_INTERVAL: Duration = Duration::from_secs(10);

/// How long a retired socket keeps receiving before it is closed.
const GRACE_PERIOD: Duration = Duration::from_secs(2);

const HEADER_SIZE: usize = 12;
const MIN_SOCKETS: usize = 1;

struct Sock {
    socket: UdpSocket,
    writes: AtomicUsize,
    retired: Notify,
}

struct BankState {
    socks: Vec<Arc<Sock>>,
    next: usize,
}

/// The shared socket bank.
pub struct ConnPool {
    selector: Arc<Selector>,
    state: Mutex<BankState>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ConnPool {
    /// Open `cpus` UDP sockets (at least one) and start their receive
    /// tasks plus the rotation ticker.
    pub fn new(cpus: usize, selector: Arc<Selector>) -> Result<Arc<ConnPool>> {
        let (shutdown, _) = broadcast::channel(1);
        let pool = Arc::new(ConnPool {
            selector,
            state: Mutex::new(BankState {
                socks: Vec::new(),
                next: 0,
            }),
            shutdown,
            closed: AtomicBool::new(false),
        });

        {
            let mut state = pool.state.lock();
            for _ in 0..cpus.max(MIN_SOCKETS) {
                let sock = new_socket()?;
                pool.spawn_recv_task(&sock);
                state.socks.push(sock);
            }
        }
        Arc::clone(&pool).spawn_rotation_task();

        Ok(pool)
    }

    /// Send one packed message to `addr` on the next socket in rotation.
    pub async fn write_msg(&self, wire: &[u8], addr: SocketAddr) -> Result<()> {
        let sock = {
            let mut state = self.state.lock();
            if state.socks.is_empty() {
                return Err(ResolveError::PoolClosed);
            }
            state.next = (state.next + 1) % state.socks.len();
            Arc::clone(&state.socks[state.next])
        };

        tokio::time::timeout(MIN_INTERVAL, sock.socket.send_to(wire, addr))
            .await
            .map_err(|_| ResolveError::TimeOut)??;

        if sock.writes.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_WRITES {
            self.rotate(&sock);
        }
        Ok(())
    }

    /// Stop the rotation ticker and every receive task, and drop all live
    /// sockets. Retired sockets close at the end of their grace period.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.state.lock().socks.clear();
    }

    /// Swap `old` for a fresh socket and let the old one drain out.
    fn rotate(&self, old: &Arc<Sock>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let replaced = {
            let mut state = self.state.lock();
            // another path may have rotated this socket already
            match state.socks.iter().position(|s| Arc::ptr_eq(s, old)) {
                Some(idx) => match new_socket() {
                    Ok(fresh) => {
                        self.spawn_recv_task(&fresh);
                        state.socks[idx] = fresh;
                        true
                    }
                    Err(e) => {
                        log::warn!("failed to open replacement socket: {}", e);
                        false
                    }
                },
                None => false,
            }
        };

        if replaced {
            let old = Arc::clone(old);
            tokio::spawn(async move {
                tokio::time::sleep(GRACE_PERIOD).await;
                old.retired.notify_one();
            });
        }
    }

    fn spawn_rotation_task(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let pool = self;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ROTATION_INTERVAL);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let worn: Vec<Arc<Sock>> = pool
                            .state
                            .lock()
                            .socks
                            .iter()
                            .filter(|s| s.writes.load(Ordering::SeqCst) > 0)
                            .cloned()
                            .collect();
                        for sock in worn {
                            pool.rotate(&sock);
                        }
                    }
                }
            }
        });
    }

    fn spawn_recv_task(&self, sock: &Arc<Sock>) {
        let selector = Arc::clone(&self.selector);
        let sock = Arc::clone(sock);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_MSG_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sock.retired.notified() => break,
                    res = sock.socket.recv_from(&mut buf) => {
                        let (len, src) = match res {
                            Ok(read) => read,
                            Err(e) => {
                                log::debug!("udp read error: {}", e);
                                continue;
                            }
                        };
                        if len < HEADER_SIZE {
                            continue;
                        }
                        let resp = match Message::from_vec(&buf[..len]) {
                            Ok(resp) => resp,
                            Err(e) => {
                                log::debug!("dropping undecodable packet from {}: {}", src, e);
                                continue;
                            }
                        };
                        if resp.queries().is_empty() {
                            continue;
                        }

                        let selector = Arc::clone(&selector);
                        tokio::spawn(async move {
                            match selector.lookup(src.ip()) {
                                Some(ns) => ns.handle_reply(resp).await,
                                None => log::debug!("response from unknown server {}", src),
                            }
                        });
                    }
                }
            }
        });
    }
}

fn new_socket() -> Result<Arc<Sock>> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::debug!("SO_REUSEPORT unavailable: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;

    Ok(Arc::new(Sock {
        socket: UdpSocket::from_std(socket.into())?,
        writes: AtomicUsize::new(0),
        retired: Notify::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_msg_reaches_destination() {
        let selector = Arc::new(Selector::random());
        let pool = ConnPool::new(2, selector).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        pool.write_msg(b"hello", dest).await.unwrap();

        let mut buf = [0u8; 32];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&b"hello"[..], &buf[..len]);

        pool.close();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let selector = Arc::new(Selector::random());
        let pool = ConnPool::new(1, selector).unwrap();
        pool.close();

        let dest = SocketAddr::from(([127, 0, 0, 1], 1));
        assert!(pool.write_msg(b"x", dest).await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_on_write_quota() {
        let selector = Arc::new(Selector::random());
        let pool = ConnPool::new(1, selector).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        for _ in 0..MAX_WRITES + 5 {
            pool.write_msg(b"x", dest).await.unwrap();
        }

        // the socket that crossed the quota has been replaced by a fresh
        // one with a zeroed write counter
        let writes = {
            let state = pool.state.lock();
            state.socks[0].writes.load(Ordering::SeqCst)
        };
        assert!(writes < MAX_WRITES);

        pool.close();
    }
}
