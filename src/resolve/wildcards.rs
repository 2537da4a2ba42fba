//! DNS wildcard detection
//!
//! A zone that answers every label under some subdomain masks brute-force
//! enumeration. The detector probes a subdomain with a handful of random
//! labels that cannot plausibly exist, caches what came back, and lets
//! callers test whether a response is just the wildcard answering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use super::conn::ConnPool;
use super::errors::Result;
use super::msgs::{self, ExtractedAnswer};
use super::nameserver::Nameserver;
use super::names;
use super::pool::Pool;
use super::selectors::Selector;

/// Probes issued per subdomain before its wildcard state is cached.
pub const NUM_WILDCARD_TESTS: usize = 3;

const PROBE_TYPES: [RecordType; 3] = [RecordType::CNAME, RecordType::A, RecordType::AAAA];

/// Cached wildcard state for one subdomain.
#[derive(Debug, Clone)]
pub struct WildcardRecord {
    pub detected: bool,
    /// Answers common to every probe round.
    pub answers: Vec<ExtractedAnswer>,
}

type RecordSlot = Arc<AsyncMutex<Option<WildcardRecord>>>;

/// Per-pool wildcard probe cache.
pub struct WildcardDetector {
    /// Dedicated resolver for probe traffic; probes ride the owning pool
    /// when unset.
    resolver: Mutex<Option<Pool>>,
    wildcards: Mutex<HashMap<String, RecordSlot>>,
}

impl WildcardDetector {
    pub fn new() -> WildcardDetector {
        WildcardDetector {
            resolver: Mutex::new(None),
            wildcards: Mutex::new(HashMap::new()),
        }
    }

    /// Route probe traffic through a dedicated upstream.
    pub fn set_resolver(&self, addr: &str, timeout: Duration) -> Result<()> {
        let ns = Nameserver::new(addr, timeout)?;
        let selector = Arc::new(Selector::single(ns));
        let conns = ConnPool::new(1, Arc::clone(&selector))?;
        let pool = Pool::new(0, selector, conns);
        *self.resolver.lock() = Some(pool);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(pool) = self.resolver.lock().take() {
            pool.stop();
        }
    }

    /// Test whether `resp` looks like a wildcard answering somewhere
    /// between `registered` and the response's own name.
    pub async fn detected(&self, pool: &Pool, resp: &Message, registered: &str) -> bool {
        let registered = names::normalize(registered);
        let mut name = match msgs::question_name(resp) {
            Some(name) => names::normalize(&name),
            None => return false,
        };
        // the leftmost label is the candidate itself, not a subdomain
        if names::num_labels(&name) > names::num_labels(&registered) {
            if let Some((_, rest)) = name.split_once('.') {
                name = rest.to_string();
            }
        }

        let observed = msgs::extract_answers(resp);

        let mut subs: Vec<String> = Vec::new();
        names::registered_to_fqdn(&registered, &name, |sub| {
            subs.push(sub.to_string());
            false
        });

        for sub in subs {
            let record = self.get_wildcard(pool, &sub).await;
            if resp_matches_wildcard(&record, &observed) {
                return true;
            }
        }
        false
    }

    /// The cached record for `sub`, probing it first if this is the first
    /// caller. Concurrent first-time callers serialize on the record's
    /// own lock instead of probing twice.
    async fn get_wildcard(&self, pool: &Pool, sub: &str) -> WildcardRecord {
        let slot = Arc::clone(
            self.wildcards
                .lock()
                .entry(sub.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
        );

        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.wildcard_test(pool, sub).await);
        }
        guard.clone().expect("record populated above")
    }

    async fn wildcard_test(&self, pool: &Pool, sub: &str) -> WildcardRecord {
        let resolver = self
            .resolver
            .lock()
            .clone()
            .unwrap_or_else(|| pool.clone());

        let mut detected = false;
        let mut common: Option<HashSet<String>> = None;
        let mut collected: Vec<ExtractedAnswer> = Vec::new();

        for _ in 0..NUM_WILDCARD_TESTS {
            let probe = match names::unlikely_name(sub) {
                Some(probe) => probe,
                None => continue,
            };

            let mut round: HashSet<String> = HashSet::new();
            for qtype in PROBE_TYPES.iter() {
                let msg = match msgs::query_msg(&probe, *qtype) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                if let Ok(resp) = resolver.exchange(msg).await {
                    for answer in msgs::extract_answers(&resp) {
                        round.insert(answer.data.clone());
                        collected.push(answer);
                    }
                }
            }

            if !round.is_empty() {
                detected = true;
            }
            common = Some(match common {
                Some(prev) => prev.intersection(&round).cloned().collect(),
                None => round,
            });
        }

        let common = common.unwrap_or_default();
        let mut seen: HashSet<(RecordType, String)> = HashSet::new();
        let answers: Vec<ExtractedAnswer> = collected
            .into_iter()
            .filter(|a| common.contains(&a.data) && seen.insert((a.rtype, a.data.clone())))
            .collect();

        if detected {
            log::info!("wildcard detected under {}", sub);
        }
        WildcardRecord { detected, answers }
    }
}

impl Default for WildcardDetector {
    fn default() -> Self {
        WildcardDetector::new()
    }
}

/// A response matches the wildcard when its answer data overlaps the
/// cached probe answers. When either side is empty there is nothing to
/// compare and the cached verdict stands.
fn resp_matches_wildcard(record: &WildcardRecord, observed: &[ExtractedAnswer]) -> bool {
    if !record.detected {
        return false;
    }
    if !record.answers.is_empty() && !observed.is_empty() {
        let cached: HashSet<&str> = record.answers.iter().map(|a| a.data.as_str()).collect();
        return observed.iter().any(|a| cached.contains(a.data.as_str()));
    }
    record.detected
}
