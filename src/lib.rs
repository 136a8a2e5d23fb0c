//! Bindforge
//!
//! A centralized management plane for BIND-compatible authoritative name
//! servers. Operator intent lives in a relational store; on demand the
//! exporter compiles the state at an audit checkpoint into a coherent,
//! versioned bundle of `named.conf` and zone files per name server,
//! validates it with the BIND checker tools, and ships it. The audit log
//! records every mutation and doubles as a replay tape for point-in-time
//! recovery.
//!
//! # Architecture
//!
//! * `config` - typed configuration with strict unknown-key rejection
//! * `zone` - record model, zone file codec, named.conf codec
//! * `store` - SQLite intent store, audited API surface, snapshots
//! * `export` - planner, materializer, checker and pusher pipeline
//! * `recovery` - snapshot restore plus audit-tape replay

/// Typed configuration loading
pub mod config;

/// Export pipeline: plan, materialize, check, push
pub mod export;

/// Point-in-time recovery engine
pub mod recovery;

/// SQLite intent store, audit log and mutating API surface
pub mod store;

/// Record model and the zone file / named.conf codecs
pub mod zone;
