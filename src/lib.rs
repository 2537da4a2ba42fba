//! Swarm DNS Resolver
//!
//! A high-throughput asynchronous DNS resolver library intended for bulk name
//! enumeration such as subdomain brute-forcing.
//!
//! # Features
//!
//! * Parallel query dispatch across a pool of upstream nameservers
//! * Adaptive per-server rate limiting driven by observed round-trip times
//! * UDP socket bank with rotation and automatic TCP fallback on truncation
//! * Random, single, and iterative-authoritative nameserver selection
//! * DNS wildcard detection
//! * NSEC zone walking
//!
//! # Architecture
//!
//! All functionality lives in the `resolve` module. Callers build a
//! [`resolve::Selector`], wrap it in a [`resolve::ConnPool`] and a
//! [`resolve::Pool`], and submit queries through `query`, `query_channel`,
//! or `exchange`.

/// Query dispatch engine and resolver strategies
pub mod resolve;
