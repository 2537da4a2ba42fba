//! correlation of in-flight requests by (id, question name)
//!
//! Every nameserver owns one table. The send path inserts, the receive
//! path removes by the reply's id and question, and a periodic sweep
//! removes entries whose deadline has passed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::names;
use super::request::Request;

/// Key for one outstanding exchange: the message id plus the question
/// name lowercased with its trailing dot removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XchgKey {
    id: u16,
    name: String,
}

impl XchgKey {
    pub fn new(id: u16, name: &str) -> XchgKey {
        XchgKey {
            id,
            name: names::normalize(name),
        }
    }
}

/// Table of pending requests for a single nameserver.
pub struct XchgTable {
    inner: Mutex<HashMap<XchgKey, Box<Request>>>,
}

impl XchgTable {
    pub fn new() -> XchgTable {
        XchgTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a pending request. When a request with the same key is
    /// already pending, the new request is handed back in `Err`.
    pub fn add(&self, req: Box<Request>) -> Result<(), Box<Request>> {
        let name = match req.qname() {
            Some(name) => name,
            None => return Err(req),
        };
        let key = XchgKey::new(req.id(), &name);

        let mut inner = self.inner.lock();
        if inner.contains_key(&key) {
            return Err(req);
        }
        inner.insert(key, req);
        Ok(())
    }

    /// Atomically take the request matching `(id, name)`.
    pub fn remove(&self, id: u16, name: &str) -> Option<Box<Request>> {
        self.inner.lock().remove(&XchgKey::new(id, name))
    }

    /// Record the send instant for `(id, name)` just before the packet is
    /// written. Entries without a stamp are never expired.
    pub fn stamp_sent(&self, id: u16, name: &str) {
        if let Some(req) = self.inner.lock().get_mut(&XchgKey::new(id, name)) {
            req.stamp_sent();
        }
    }

    /// Take every request that was sent more than `timeout` ago.
    pub fn remove_expired(&self, timeout: Duration) -> Vec<Box<Request>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<XchgKey> = inner
            .iter()
            .filter(|(_, req)| match req.sent_at() {
                Some(sent_at) => now > sent_at + timeout,
                None => false,
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| inner.remove(key))
            .collect()
    }

    /// Drain the table, returning every pending request.
    pub fn remove_all(&self) -> Vec<Box<Request>> {
        self.inner.lock().drain().map(|(_, req)| req).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for XchgTable {
    fn default() -> Self {
        XchgTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::msgs;
    use crate::resolve::request::RequestPool;
    use hickory_proto::op::Message;
    use hickory_proto::rr::RecordType;
    use tokio::sync::mpsc;

    fn request_for(pool: &RequestPool, name: &str, id: u16) -> Box<Request> {
        let mut msg: Message = msgs::query_msg(name, RecordType::A).unwrap();
        msg.set_id(id);
        let (tx, _rx) = mpsc::channel(1);
        pool.acquire(msg, tx)
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(
            XchgKey::new(7, "Foo.EXAMPLE.com."),
            XchgKey::new(7, "foo.example.com")
        );
        assert_ne!(XchgKey::new(7, "foo.example.com"), XchgKey::new(8, "foo.example.com"));
    }

    #[test]
    fn test_add_remove() {
        let pool = RequestPool::new();
        let table = XchgTable::new();

        table.add(request_for(&pool, "example.com", 42)).unwrap();
        assert_eq!(1, table.len());

        // case and trailing dot do not matter on removal
        let req = table.remove(42, "EXAMPLE.com.").expect("present");
        assert_eq!(42, req.id());
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let pool = RequestPool::new();
        let table = XchgTable::new();

        table.add(request_for(&pool, "example.com", 42)).unwrap();
        assert!(table.add(request_for(&pool, "example.com", 42)).is_err());

        // the key frees up once the first request is taken
        table.remove(42, "example.com").unwrap();
        assert!(table.add(request_for(&pool, "example.com", 42)).is_ok());
    }

    #[test]
    fn test_remove_expired() {
        let pool = RequestPool::new();
        let table = XchgTable::new();

        table.add(request_for(&pool, "sent.example.com", 1)).unwrap();
        table.add(request_for(&pool, "unsent.example.com", 2)).unwrap();
        table.stamp_sent(1, "sent.example.com");

        std::thread::sleep(Duration::from_millis(20));

        let expired = table.remove_expired(Duration::from_millis(5));
        assert_eq!(1, expired.len());
        assert_eq!(1, expired[0].id());

        // the unstamped entry is untouched
        assert_eq!(1, table.len());
        assert!(table.remove_expired(Duration::from_millis(5)).is_empty());
    }

    #[test]
    fn test_remove_all() {
        let pool = RequestPool::new();
        let table = XchgTable::new();

        for id in 0..5u16 {
            table
                .add(request_for(&pool, &format!("n{}.example.com", id), id))
                .unwrap();
        }

        let drained = table.remove_all();
        assert_eq!(5, drained.len());
        assert!(table.is_empty());
    }
}
