//! Opt-in `tracing` subscriber installation (§0.2). Every collaborator in
//! this workspace emits `tracing` events directly; none of them install a
//! global subscriber themselves, so the binaries that embed this crate
//! decide whether and how to wire one up. This is that convenience, not a
//! requirement — a caller that wants a different layer stack (OpenTelemetry
//! export, a TUI-aware writer, ...) is free to call
//! `tracing_subscriber::fmt()` or `tracing::subscriber::set_global_default`
//! directly instead.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use knowbase_core::error::{KbError, KbResult};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs a process-global `tracing` subscriber. Reads `RUST_LOG`,
/// falling back to `info` when unset or unparsable. Safe to call more than
/// once — later calls are a no-op, since more than one collaborator
/// embedding this crate may each try to install one at startup.
pub fn install_tracing_subscriber() -> KbResult<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| KbError::storage(format!("failed to install tracing subscriber: {e}")))?;

    let _ = INSTALLED.set(());
    Ok(())
}
