//! public query API
//!
//! The pool is the front door of the engine. It owns the selector, the
//! socket bank, the request recycling pool, the optional global QPS cap,
//! and the wildcard detector. Submissions are dispatched on background
//! tasks; every submitted message produces exactly one delivery on its
//! channel, with the synthetic no-response code standing in for timeouts
//! and transport failures.
//!
//! `Pool` is a cheap handle: clones share the same engine, and the engine
//! shuts down when the last handle is dropped.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::dnssec::rdata::NSEC;
use tokio::sync::mpsc;

use super::conn::ConnPool;
use super::errors::{ResolveError, Result};
use super::nameserver::Nameserver;
use super::rate::QpsLimiter;
use super::request::{is_no_response, Request, RequestPool};
use super::selectors::Selector;
use super::walk::{self, NsecWalkError};
use super::wildcards::WildcardDetector;

/// Suggested per-name retry budget for callers driving bulk enumeration.
pub const MAX_QUERY_ATTEMPTS: usize = 5;

/// The resolver pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    selector: Arc<Selector>,
    conns: Arc<ConnPool>,
    reqs: RequestPool,
    qps: QpsLimiter,
    wildcards: WildcardDetector,
    stopped: AtomicBool,
}

impl Pool {
    /// Build a pool over an existing selector and socket bank. A `qps` of
    /// zero leaves the global rate uncapped.
    pub fn new(qps: u32, selector: Arc<Selector>, conns: Arc<ConnPool>) -> Pool {
        Pool {
            inner: Arc::new(Inner {
                selector,
                conns,
                reqs: RequestPool::new(),
                qps: QpsLimiter::new(qps),
                wildcards: WildcardDetector::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Convenience constructor: a random-selector pool over the given
    /// resolver addresses with one socket per CPU.
    pub fn with_resolvers(qps: u32, timeout: Duration, resolvers: &[String]) -> Result<Pool> {
        let selector = Arc::new(Selector::random());
        for addr in resolvers {
            match Nameserver::new(addr, timeout) {
                Ok(ns) => selector.add(ns),
                Err(e) => log::warn!("skipping resolver {}: {}", addr, e),
            }
        }
        if selector.all().is_empty() {
            return Err(ResolveError::NoServerFound);
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let conns = ConnPool::new(cpus, Arc::clone(&selector))?;
        Ok(Pool::new(qps, selector, conns))
    }

    /// Submit `msg` without waiting. The response, or the query echoed
    /// back with the no-response code, arrives on `tx`.
    pub fn query(&self, msg: Message, tx: mpsc::Sender<Message>) {
        let inner = Arc::clone(&self.inner);
        let req = self.inner.reqs.acquire(msg, tx);
        tokio::spawn(async move {
            inner.dispatch(req).await;
        });
    }

    /// Submit `msg` and hand back the channel its response arrives on.
    pub fn query_channel(&self, msg: Message) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1);
        self.query(msg, tx);
        rx
    }

    /// Submit `msg` and wait for its response. The synthetic no-response
    /// code surfaces as an error.
    pub async fn exchange(&self, msg: Message) -> Result<Message> {
        let mut rx = self.query_channel(msg);
        match rx.recv().await {
            Some(resp) if !is_no_response(&resp) => Ok(resp),
            Some(_) => Err(ResolveError::NoResponse),
            None => Err(ResolveError::PoolClosed),
        }
    }

    /// Idempotent shutdown: closes the socket bank and every nameserver,
    /// draining pending requests with the no-response code.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Change the global QPS cap. Zero removes it.
    pub fn set_max_qps(&self, qps: u32) {
        self.inner.qps.set_qps(qps);
    }

    /// Grow a random-selector pool with more upstream resolvers.
    pub fn add_resolvers(&self, timeout: Duration, resolvers: &[String]) {
        for addr in resolvers {
            match Nameserver::new(addr, timeout) {
                Ok(ns) => self.inner.selector.add(ns),
                Err(e) => log::warn!("skipping resolver {}: {}", addr, e),
            }
        }
    }

    /// Remove and close the resolver at `addr`.
    pub fn remove_resolver(&self, addr: IpAddr) {
        self.inner.selector.remove(addr);
    }

    /// Route wildcard probe traffic through a dedicated upstream.
    pub fn set_detection_resolver(&self, addr: &str, timeout: Duration) -> Result<()> {
        self.inner.wildcards.set_resolver(addr, timeout)
    }

    /// Test whether `resp` is a wildcard answering under
    /// `registered_domain`.
    pub async fn wildcard_detected(&self, resp: &Message, registered_domain: &str) -> bool {
        self.inner
            .wildcards
            .detected(self, resp, registered_domain)
            .await
    }

    /// Walk the NSEC chain of `domain`.
    pub async fn nsec_traversal(
        &self,
        domain: &str,
    ) -> std::result::Result<Vec<NSEC>, NsecWalkError> {
        walk::nsec_traversal(self, domain).await
    }
}

impl Inner {
    async fn dispatch(&self, req: Box<Request>) {
        if self.stopped.load(Ordering::SeqCst) {
            req.fail();
            return;
        }

        let qname = match req.qname() {
            Some(qname) => qname,
            None => {
                req.fail();
                return;
            }
        };

        let ns = match self.selector.get(&qname).await {
            Some(ns) => ns,
            None => {
                log::debug!("no nameserver available for {}", qname);
                req.fail();
                return;
            }
        };

        self.qps.take().await;
        ns.send_request(req, &self.conns).await;
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("stopping resolver pool");
        self.conns.close();
        self.selector.close();
        self.wildcards.stop();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}
