//! nameserver selection strategies
//!
//! Three strategies answer "which upstream server takes this query":
//! a uniform pick over a static pool, a single fixed server, and an
//! iterative walk from the root servers down to the zone holding the
//! name. The selector also resolves reply source addresses back to their
//! nameserver so the socket bank can demultiplex.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use parking_lot::Mutex;
use rand::Rng;

use super::backoff::truncated_exponential_backoff;
use super::msgs;
use super::nameserver::Nameserver;
use super::names;
use super::netutil;
use super::roots::root_nameservers;

/// Attempts per NS or A probe while walking down from a parent zone.
const MAX_PROBE_ATTEMPTS: u32 = 10;

/// Per-attempt deadline for one TCP probe. Parent servers on slow
/// delegation chains get a full minute before the attempt is retried.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

const PROBE_BACKOFF: Duration = Duration::from_millis(250);
const PROBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A nameserver selection strategy.
pub enum Selector {
    Random(RandomSelector),
    Single(SingleSelector),
    Authoritative(AuthoritativeSelector),
}

impl Selector {
    /// Uniform pick over a pool populated with [`Selector::add`].
    pub fn random() -> Selector {
        Selector::Random(RandomSelector::new())
    }

    /// Every query goes to the one configured server.
    pub fn single(ns: Arc<Nameserver>) -> Selector {
        Selector::Single(SingleSelector { ns })
    }

    /// Iterative selection starting from the hard-coded root hints.
    pub fn authoritative(timeout: Duration) -> Selector {
        Selector::Authoritative(AuthoritativeSelector::new(timeout, root_nameservers(timeout)))
    }

    /// Iterative selection with a caller-provided root set.
    pub fn authoritative_with_roots(timeout: Duration, roots: Vec<Arc<Nameserver>>) -> Selector {
        Selector::Authoritative(AuthoritativeSelector::new(timeout, roots))
    }

    /// Choose a nameserver for `fqdn`.
    pub async fn get(&self, fqdn: &str) -> Option<Arc<Nameserver>> {
        match self {
            Selector::Random(s) => s.get(),
            Selector::Single(s) => s.get(),
            Selector::Authoritative(s) => s.get(fqdn).await,
        }
    }

    /// Resolve a reply's source address to its nameserver.
    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<Nameserver>> {
        match self {
            Selector::Random(s) => s.lookup(addr),
            Selector::Single(s) => s.lookup(addr),
            Selector::Authoritative(s) => s.lookup(addr),
        }
    }

    /// Add a nameserver to the pool. Only the random strategy grows this
    /// way; the other strategies manage their own membership.
    pub fn add(&self, ns: Arc<Nameserver>) {
        match self {
            Selector::Random(s) => s.add(ns),
            _ => log::debug!("selector does not accept external nameservers"),
        }
    }

    /// Remove (and close) the nameserver at `addr`.
    pub fn remove(&self, addr: IpAddr) {
        if let Selector::Random(s) = self {
            s.remove(addr);
        }
    }

    /// Every nameserver known to the selector.
    pub fn all(&self) -> Vec<Arc<Nameserver>> {
        match self {
            Selector::Random(s) => s.all(),
            Selector::Single(s) => vec![Arc::clone(&s.ns)],
            Selector::Authoritative(s) => s.all(),
        }
    }

    /// Close every nameserver, draining their pending requests.
    pub fn close(&self) {
        match self {
            Selector::Random(s) => s.close(),
            Selector::Single(s) => s.ns.close(),
            Selector::Authoritative(s) => s.close(),
        }
    }
}

fn pick_open(list: &[Arc<Nameserver>]) -> Option<Arc<Nameserver>> {
    let open: Vec<&Arc<Nameserver>> = list.iter().filter(|ns| !ns.is_closed()).collect();
    if open.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0, open.len());
    Some(Arc::clone(open[idx]))
}

struct RandomState {
    list: Vec<Arc<Nameserver>>,
    lookup: HashMap<IpAddr, Arc<Nameserver>>,
}

/// Uniform selection over a static pool.
pub struct RandomSelector {
    state: Mutex<RandomState>,
}

impl RandomSelector {
    fn new() -> RandomSelector {
        RandomSelector {
            state: Mutex::new(RandomState {
                list: Vec::new(),
                lookup: HashMap::new(),
            }),
        }
    }

    fn get(&self) -> Option<Arc<Nameserver>> {
        pick_open(&self.state.lock().list)
    }

    fn lookup(&self, addr: IpAddr) -> Option<Arc<Nameserver>> {
        self.state.lock().lookup.get(&addr).cloned()
    }

    fn add(&self, ns: Arc<Nameserver>) {
        let mut state = self.state.lock();
        // a second add with the same address is ignored
        if state.lookup.contains_key(&ns.ip()) {
            return;
        }
        state.lookup.insert(ns.ip(), Arc::clone(&ns));
        state.list.push(ns);
    }

    fn remove(&self, addr: IpAddr) {
        let mut state = self.state.lock();
        if let Some(ns) = state.lookup.remove(&addr) {
            state.list.retain(|n| n.ip() != addr);
            ns.close();
        }
    }

    fn all(&self) -> Vec<Arc<Nameserver>> {
        self.state.lock().list.clone()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        for ns in state.list.drain(..) {
            ns.close();
        }
        state.lookup.clear();
    }
}

/// A single fixed upstream.
pub struct SingleSelector {
    ns: Arc<Nameserver>,
}

impl SingleSelector {
    fn get(&self) -> Option<Arc<Nameserver>> {
        if self.ns.is_closed() {
            None
        } else {
            Some(Arc::clone(&self.ns))
        }
    }

    fn lookup(&self, addr: IpAddr) -> Option<Arc<Nameserver>> {
        if self.ns.ip() == addr {
            Some(Arc::clone(&self.ns))
        } else {
            None
        }
    }
}

struct AuthState {
    list: Vec<Arc<Nameserver>>,
    lookup: HashMap<IpAddr, Arc<Nameserver>>,
    fqdn_to_servers: HashMap<String, Vec<String>>,
    fqdn_to_ns: HashMap<String, Vec<Arc<Nameserver>>>,
    server_to_ns: HashMap<String, Arc<Nameserver>>,
    roots: Vec<Arc<Nameserver>>,
}

/// Iterative-authoritative selection.
///
/// For a query name the selector walks from the closest zone it already
/// knows toward the name, resolving one NS set per label against the
/// parent zone's servers. Every zone boundary is cached so the parent
/// probes run once per zone, not once per query.
pub struct AuthoritativeSelector {
    timeout: Duration,
    state: Mutex<AuthState>,
}

impl AuthoritativeSelector {
    fn new(timeout: Duration, roots: Vec<Arc<Nameserver>>) -> AuthoritativeSelector {
        let mut lookup = HashMap::new();
        for ns in &roots {
            lookup.insert(ns.ip(), Arc::clone(ns));
        }
        AuthoritativeSelector {
            timeout,
            state: Mutex::new(AuthState {
                list: Vec::new(),
                lookup,
                fqdn_to_servers: HashMap::new(),
                fqdn_to_ns: HashMap::new(),
                server_to_ns: HashMap::new(),
                roots,
            }),
        }
    }

    async fn get(&self, fqdn: &str) -> Option<Arc<Nameserver>> {
        let fqdn = names::normalize(fqdn);
        if fqdn.is_empty() {
            return None;
        }
        let tld = fqdn.rsplit('.').next()?.to_string();

        self.populate(&fqdn, &tld).await;

        let state = self.state.lock();
        let set = state.fqdn_to_ns.get(&fqdn).or_else(|| {
            // the name itself may not be a zone cut; use its parent zone
            fqdn.split_once('.')
                .and_then(|(_, parent)| state.fqdn_to_ns.get(parent))
        })?;
        pick_open(set)
    }

    fn lookup(&self, addr: IpAddr) -> Option<Arc<Nameserver>> {
        self.state.lock().lookup.get(&addr).cloned()
    }

    fn all(&self) -> Vec<Arc<Nameserver>> {
        self.state.lock().list.clone()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        for ns in state.list.drain(..) {
            ns.close();
        }
        for ns in state.roots.drain(..) {
            ns.close();
        }
        state.lookup.clear();
        state.fqdn_to_ns.clear();
        state.server_to_ns.clear();
    }

    /// Fill `fqdn_to_ns` for every zone between the closest cached suffix
    /// of `fqdn` and `fqdn` itself.
    async fn populate(&self, fqdn: &str, tld: &str) {
        let (mut parent, start) = {
            let state = self.state.lock();
            let mut found: Option<(String, Vec<Arc<Nameserver>>)> = None;
            names::fqdn_to_registered(fqdn, tld, |sub| {
                if let Some(set) = state.fqdn_to_ns.get(sub) {
                    found = Some((sub.to_string(), set.clone()));
                    true
                } else {
                    false
                }
            });
            match found {
                Some((last, set)) => (set, last),
                None => (state.roots.clone(), tld.to_string()),
            }
        };

        let mut subs: Vec<String> = Vec::new();
        names::registered_to_fqdn(&start, fqdn, |sub| {
            subs.push(sub.to_string());
            false
        });

        for sub in subs {
            if let Some(set) = self.state.lock().fqdn_to_ns.get(&sub) {
                parent = set.clone();
                continue;
            }
            match self.resolve_zone(&sub, &parent).await {
                Some(set) => {
                    self.state.lock().fqdn_to_ns.insert(sub, set.clone());
                    parent = set;
                }
                // no delegation below this point; deeper names use the
                // parent zone's servers
                None => break,
            }
        }
    }

    /// Resolve the NS set for `sub` by querying the parent zone's servers.
    async fn resolve_zone(
        &self,
        sub: &str,
        parent: &[Arc<Nameserver>],
    ) -> Option<Vec<Arc<Nameserver>>> {
        let servers = {
            let cached = self.state.lock().fqdn_to_servers.get(sub).cloned();
            match cached {
                Some(servers) => servers,
                None => {
                    let servers = self.query_ns(sub, parent).await?;
                    self.state
                        .lock()
                        .fqdn_to_servers
                        .insert(sub.to_string(), servers.clone());
                    servers
                }
            }
        };

        let mut set: Vec<Arc<Nameserver>> = Vec::new();
        for server in &servers {
            if let Some(ns) = self.state.lock().server_to_ns.get(server).cloned() {
                set.push(ns);
                continue;
            }
            if let Some(ip) = self.query_a(server, parent).await {
                let ns = Nameserver::from_addr(SocketAddr::new(ip, 53), self.timeout);
                let mut state = self.state.lock();
                state.server_to_ns.insert(server.clone(), Arc::clone(&ns));
                state.lookup.insert(ip, Arc::clone(&ns));
                state.list.push(Arc::clone(&ns));
                set.push(ns);
            }
        }

        if set.is_empty() {
            None
        } else {
            Some(set)
        }
    }

    async fn query_ns(&self, sub: &str, parent: &[Arc<Nameserver>]) -> Option<Vec<String>> {
        let resp = self.tcp_query(sub, RecordType::NS, parent).await?;

        let mut servers: Vec<String> = Vec::new();
        for record in resp.answers().iter().chain(resp.name_servers()) {
            if let Some(RData::NS(ns_name)) = record.data() {
                let name = names::normalize(&ns_name.0.to_ascii());
                if !servers.contains(&name) {
                    servers.push(name);
                }
            }
        }

        if servers.is_empty() {
            None
        } else {
            Some(servers)
        }
    }

    async fn query_a(&self, server: &str, parent: &[Arc<Nameserver>]) -> Option<IpAddr> {
        let resp = self.tcp_query(server, RecordType::A, parent).await?;
        resp.answers().iter().find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            _ => None,
        })
    }

    async fn tcp_query(
        &self,
        name: &str,
        qtype: RecordType,
        parent: &[Arc<Nameserver>],
    ) -> Option<Message> {
        let msg = msgs::query_msg(name, qtype).ok()?;

        for attempt in 0..MAX_PROBE_ATTEMPTS {
            let ns = pick_open(parent)?;
            match netutil::tcp_exchange(&msg, ns.addr(), PROBE_TIMEOUT).await {
                Ok(resp) => return Some(resp),
                Err(e) => {
                    log::debug!("{:?} probe for {} against {} failed: {}", qtype, name, ns.addr(), e);
                    tokio::time::sleep(truncated_exponential_backoff(
                        attempt,
                        PROBE_BACKOFF,
                        PROBE_BACKOFF_MAX,
                    ))
                    .await;
                }
            }
        }

        None
    }
}
