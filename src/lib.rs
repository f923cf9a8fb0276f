//! Beam synchronous acquisition service.
//!
//! Subscribes to named live telemetry signals, aligns their updates by
//! timestamp into coherent rows, and republishes completed rows as a
//! streaming column-typed table.

pub mod aligner;
pub mod config;
pub mod coordinator;
pub mod export;
pub mod ingress;
pub mod source;
pub mod table;
pub mod tunables;
pub mod value;
