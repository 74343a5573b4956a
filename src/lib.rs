//! Tollgate - Per-Identity Admission Control
//!
//! This crate decides, per inbound request, whether to allow or reject
//! traffic based on the client address or access token making it. Each
//! identity gets a fixed one-second request quota; identities that exceed it
//! are banned for a configurable duration. Counters and bans live in a
//! pluggable storage backend (Redis, Memcached, PostgreSQL, MySQL, or
//! process memory).

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
