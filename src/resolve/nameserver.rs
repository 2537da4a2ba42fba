//! upstream nameserver state and request lifecycle
//!
//! A nameserver owns the exchange table and rate tracker for one upstream
//! address. The send path blocks on the adaptive rate limiter, parks the
//! request in the exchange table, and writes the packet through the shared
//! socket bank. Replies come back through [`handle_reply`], driven by the
//! socket bank's receive tasks. A background task sweeps the table for
//! requests whose deadline has passed.
//!
//! [`handle_reply`]: Nameserver::handle_reply

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::sync::broadcast;

use super::conn::ConnPool;
use super::errors::{ResolveError, Result};
use super::msgs;
use super::netutil;
use super::rate::RateTracker;
use super::request::Request;
use super::xchg::XchgTable;

/// Deadline for a pending request before it is failed with the synthetic
/// no-response code.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the one-shot TCP retry performed after a truncated
/// UDP reply.
const TCP_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

const DNS_PORT: u16 = 53;

/// One upstream DNS server.
pub struct Nameserver {
    addr: SocketAddr,
    xchgs: XchgTable,
    rate: RateTracker,
    timeout: Duration,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl Nameserver {
    /// Resolve `addr` ("ip" or "ip:port", port defaulting to 53) and start
    /// the timeout sweep. Must be called from a tokio runtime.
    pub fn new(addr: &str, timeout: Duration) -> Result<Arc<Nameserver>> {
        Ok(Self::from_addr(parse_server_addr(addr)?, timeout))
    }

    /// Like [`Nameserver::new`] for an already-resolved address.
    pub fn from_addr(addr: SocketAddr, timeout: Duration) -> Arc<Nameserver> {
        let (shutdown, _) = broadcast::channel(1);
        let ns = Arc::new(Nameserver {
            addr,
            xchgs: XchgTable::new(),
            rate: RateTracker::new(),
            timeout,
            closed: AtomicBool::new(false),
            shutdown,
        });
        Arc::clone(&ns).spawn_timeout_task();
        ns
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn xchgs(&self) -> &XchgTable {
        &self.xchgs
    }

    pub fn rate(&self) -> &RateTracker {
        &self.rate
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one request through `conns`. Any failure along the way fails
    /// the request with the synthetic no-response code; the caller gets
    /// exactly one delivery either way.
    pub async fn send_request(&self, mut req: Box<Request>, conns: &ConnPool) {
        if self.is_closed() {
            req.fail();
            return;
        }

        self.rate.take().await;

        req.set_server(self.addr);
        let id = req.id();
        let qname = match req.qname() {
            Some(qname) => qname,
            None => {
                req.fail();
                return;
            }
        };
        let wire = match req.msg().to_vec() {
            Ok(wire) => wire,
            Err(e) => {
                log::warn!("failed to pack query for {}: {}", qname, e);
                req.fail();
                return;
            }
        };

        if let Err(req) = self.xchgs.add(req) {
            log::debug!("exchange key in use: {}:{}", id, qname);
            req.fail();
            return;
        }

        self.xchgs.stamp_sent(id, &qname);
        if let Err(e) = conns.write_msg(&wire, self.addr).await {
            log::debug!("udp send to {} failed: {}", self.addr, e);
            if let Some(req) = self.xchgs.remove(id, &qname) {
                req.fail();
            }
        }
    }

    /// Match `resp` to its pending request and complete it. Truncated
    /// replies are retried once over TCP; everything else is delivered
    /// as-is and feeds the rate tracker.
    pub async fn handle_reply(&self, resp: Message) {
        let qname = match msgs::question_name(&resp) {
            Some(qname) => qname,
            None => return,
        };
        let mut req = match self.xchgs.remove(resp.id(), &qname) {
            Some(req) => req,
            None => {
                log::debug!("discarding unmatched response for {}", qname);
                return;
            }
        };

        if resp.truncated() {
            log::debug!("truncated response for {}, retrying over tcp", qname);
            match netutil::tcp_exchange(req.msg(), self.addr, TCP_FALLBACK_TIMEOUT).await {
                Ok(tcp_resp) => {
                    req.respond(tcp_resp);
                    req.release();
                }
                Err(e) => {
                    log::debug!("tcp retry against {} failed: {}", self.addr, e);
                    req.fail();
                }
            }
            return;
        }

        let rtt = req.sent_at().map(|sent_at| sent_at.elapsed());
        req.respond(resp);
        req.release();
        if let Some(rtt) = rtt {
            self.rate.report_rtt(rtt);
        }
    }

    /// Idempotent close. Every pending request is drained and failed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        for req in self.xchgs.remove_all() {
            req.fail();
        }
    }

    fn spawn_timeout_task(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let ns = self;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ns.timeout);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        for req in ns.xchgs.remove_expired(ns.timeout) {
                            log::debug!(
                                "request {}:{:?} to {} timed out",
                                req.id(),
                                req.qname(),
                                ns.addr,
                            );
                            req.fail();
                        }
                    }
                }
            }
        });
    }
}

fn parse_server_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(sockaddr) = addr.parse::<SocketAddr>() {
        return Ok(sockaddr);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }
    Err(ResolveError::InvalidAddr)
}
