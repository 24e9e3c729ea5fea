//! wallet-sweeper
//!
//! Daemon that keeps draining a wallet down to a small fee reserve:
//! every lamport above the reserve and the full balance of every SPL
//! token holding is transferred to a fixed recipient on a fixed polling
//! interval. Transfer failures are logged and skipped; the loop never
//! stops on its own.
//!
//! Configuration is environment-only (see `config`): RPC_URL,
//! PRIVATE_KEY, RECIPIENT_ADDRESS, plus optional RESERVE_SOL,
//! POLL_INTERVAL_MS and DRY_RUN.

mod config;
mod ledger;
mod sweep;

use anyhow::Result;
use solana_sdk::signature::Signer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::ledger::SolanaLedger;
use crate::sweep::Sweeper;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(
        "loaded configuration:\n{}",
        serde_json::to_string_pretty(&settings.redacted())?
    );
    info!(
        owner = %settings.owner.pubkey(),
        recipient = %settings.recipient,
        "starting sweep loop"
    );

    let ledger = SolanaLedger::new(settings.rpc_url.clone());
    Sweeper::new(ledger, settings).run().await;
    Ok(())
}
