//! Transactions-per-second monitor for JSON-RPC blockchain nodes.
//!
//! Blocks flow from [`chain`] through the [`aggregator`] into the record
//! store, the CSV report and every configured [`sink`]. [`monitor`] wires
//! the pieces together for streaming or block-range runs.

pub mod aggregator;
pub mod chain;
pub mod config;
pub mod monitor;
pub mod server;
pub mod sink;
