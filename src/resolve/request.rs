//! request values and their recycling pool
//!
//! A request is the unit of work moving through the engine. It is owned by
//! the pool while pending, parked in a nameserver's exchange table between
//! send and reply, and handed back to its recycling pool once a response
//! has been delivered.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use hickory_proto::op::{Message, ResponseCode};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::msgs;

/// Synthetic response code delivered on timeout or transport failure.
/// Never encoded to the wire, only set on locally delivered messages.
pub const NO_RESPONSE: ResponseCode = ResponseCode::Unknown(50);

/// Returns true when `msg` carries the synthetic no-response code.
pub fn is_no_response(msg: &Message) -> bool {
    msg.response_code() == NO_RESPONSE
}

/// An in-flight query and the channel its response is delivered on.
#[derive(Debug)]
pub struct Request {
    msg: Message,
    tx: Option<mpsc::Sender<Message>>,
    server: Option<SocketAddr>,
    sent_at: Option<Instant>,
    home: Weak<PoolInner>,
}

impl Request {
    pub fn msg(&self) -> &Message {
        &self.msg
    }

    pub fn id(&self) -> u16 {
        self.msg.id()
    }

    /// The name of the request's question, in ascii presentation form.
    pub fn qname(&self) -> Option<String> {
        msgs::question_name(&self.msg)
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn set_server(&mut self, addr: SocketAddr) {
        self.server = Some(addr);
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn stamp_sent(&mut self) {
        self.sent_at = Some(Instant::now());
    }

    /// Deliver `resp` to the caller. At most one delivery happens per
    /// request; later calls are ignored. A full or closed channel drops
    /// the response.
    pub fn respond(&mut self, resp: Message) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.try_send(resp) {
                log::debug!("response channel unavailable: {}", e);
            }
        }
    }

    /// Deliver the request's own query back with [`NO_RESPONSE`] set.
    pub fn no_response(&mut self) {
        let mut resp = self.msg.clone();
        resp.set_response_code(NO_RESPONSE);
        self.respond(resp);
    }

    /// Fail and recycle in one step.
    pub fn fail(mut self: Box<Self>) {
        self.no_response();
        self.release();
    }

    /// Return this request to its recycling pool.
    pub fn release(mut self: Box<Self>) {
        if let Some(home) = self.home.upgrade() {
            self.reset();
            home.put(self);
        }
    }

    fn reset(&mut self) {
        self.msg = Message::new();
        self.tx = None;
        self.server = None;
        self.sent_at = None;
    }
}

struct PoolInner {
    free: Mutex<Vec<Box<Request>>>,
}

impl PoolInner {
    fn put(&self, req: Box<Request>) {
        let mut free = self.free.lock();
        if free.len() < RequestPool::MAX_FREE {
            free.push(req);
        }
    }
}

/// A free-list of recycled [`Request`] values, shared by one pool.
#[derive(Clone)]
pub struct RequestPool {
    inner: Arc<PoolInner>,
}

impl RequestPool {
    /// Upper bound on parked requests; beyond this they are simply dropped.
    const MAX_FREE: usize = 1024;

    pub fn new() -> RequestPool {
        RequestPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Take a recycled request, or allocate one, and arm it with a query
    /// and its response channel.
    pub fn acquire(&self, msg: Message, tx: mpsc::Sender<Message>) -> Box<Request> {
        let mut req = self.inner.free.lock().pop().unwrap_or_else(|| {
            Box::new(Request {
                msg: Message::new(),
                tx: None,
                server: None,
                sent_at: None,
                home: Weak::new(),
            })
        });

        req.msg = msg;
        req.tx = Some(tx);
        req.server = None;
        req.sent_at = None;
        req.home = Arc::downgrade(&self.inner);
        req
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        RequestPool::new()
    }
}
