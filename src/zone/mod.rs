//! Zone-level building blocks shared across the export pipeline.
//!
//! * `record` - typed record arguments and the central type schema table
//! * `codec` - master-format zone file parsing and deterministic emission
//! * `named_conf` - BIND named.conf parsing, projection and emission

/// Master-format zone file parser and deterministic emitter
pub mod codec;

/// BIND named.conf codec and domain projection
pub mod named_conf;

/// Typed DNS record model and argument schema table
pub mod record;
