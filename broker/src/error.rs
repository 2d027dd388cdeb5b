//! Broker error taxonomy, one variant per spec.md §4.2's named failure mode.
//!
//! Grounded on `TunnelError` in
//! `examples/other_examples/06e65e00_ZingerLittleBee-EXLO__apps-tunnl-src-main.rs.rs`
//! and `SshError` in `examples/AnalyseDeCircuit-oxideterm/src-tauri/src/ssh/error.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid session target {0:?}")]
    InvalidSessionTarget(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("register failed: {0}")]
    RegisterFailed(String),
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("client session failed: {0}")]
    ClientSessionFailed(String),
}
