//! Query dispatch engine
//!
//! This module implements the resolver core:
//!
//! * `pool` - public entry points for submitting queries
//! * `selectors` - nameserver selection strategies
//! * `nameserver` - per-server send, reply, and timeout handling
//! * `conn` - the UDP socket bank shared by all nameservers
//! * `xchg` - correlation of replies to in-flight requests
//! * `rate` - adaptive per-server and global rate limiting
//! * `wildcards` - DNS wildcard detection
//! * `walk` - NSEC zone walking

/// Truncated exponential backoff with jitter
pub mod backoff;

/// UDP socket bank with rotation and reply demultiplexing
pub mod conn;

/// Engine error types
pub mod errors;

/// Query, reverse, and walk message construction and answer extraction
pub mod msgs;

/// Upstream nameserver state and request lifecycle
pub mod nameserver;

/// Domain name walking and unlikely-label generation
pub mod names;

/// Internal async TCP framing utilities
mod netutil;

/// Public query API
pub mod pool;

/// Adaptive token-bucket rate limiting
pub mod rate;

/// Request values and recycling
pub mod request;

/// Root server hints
pub mod roots;

/// Nameserver selection strategies
pub mod selectors;

/// NSEC zone walking
pub mod walk;

/// DNS wildcard detection
pub mod wildcards;

/// In-flight request correlation
pub mod xchg;

pub use self::conn::ConnPool;
pub use self::errors::ResolveError;
pub use self::nameserver::{Nameserver, DEFAULT_TIMEOUT};
pub use self::pool::Pool;
pub use self::request::{Request, RequestPool, NO_RESPONSE};
pub use self::selectors::Selector;
