//! Environment-driven settings.
//!
//! Behavior is fully environment-driven; there are no CLI flags. The
//! three required variables match the original deployment: `RPC_URL`,
//! `PRIVATE_KEY` (base58-encoded secret key) and `RECIPIENT_ADDRESS`.
//! Everything else has a default.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};

/// Number of lamports in one SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// SOL left on the owner account to cover future transaction fees.
const DEFAULT_RESERVE_SOL: f64 = 0.005;

/// Delay between the end of one sweep pass and the start of the next.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

const REQUIRED_VARS: [&str; 3] = ["RPC_URL", "PRIVATE_KEY", "RECIPIENT_ADDRESS"];

/// Runtime settings, loaded once at startup and never reloaded.
pub struct Settings {
    /// Solana RPC endpoint used for every ledger operation.
    pub rpc_url: String,

    /// Keypair of the wallet being swept.
    pub owner: Keypair,

    /// Destination of every transfer, fixed for the process lifetime.
    pub recipient: Pubkey,

    /// Lamports kept back from the native sweep.
    pub reserve_lamports: u64,

    /// Pause between polling iterations.
    pub poll_interval: Duration,

    /// Log intended transfers without submitting anything.
    pub dry_run: bool,
}

impl Settings {
    /// Reads settings from the environment, honoring a `.env` file if one
    /// is present. Missing or malformed variables are fatal.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|name| std::env::var(name).map_or(true, |value| value.is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!(
                "missing required environment variables: {}",
                missing.join(", ")
            ));
        }

        let rpc_url = std::env::var("RPC_URL")?;
        let owner = decode_private_key(&std::env::var("PRIVATE_KEY")?)?;
        let recipient = std::env::var("RECIPIENT_ADDRESS")?
            .parse()
            .context("parsing RECIPIENT_ADDRESS")?;

        let reserve_sol = match std::env::var("RESERVE_SOL") {
            Ok(raw) => raw.parse::<f64>().context("parsing RESERVE_SOL")?,
            Err(_) => DEFAULT_RESERVE_SOL,
        };
        let poll_interval_ms = match std::env::var("POLL_INTERVAL_MS") {
            Ok(raw) => raw.parse::<u64>().context("parsing POLL_INTERVAL_MS")?,
            Err(_) => DEFAULT_POLL_INTERVAL_MS,
        };
        let dry_run = matches!(
            std::env::var("DRY_RUN").as_deref(),
            Ok("1") | Ok("true") | Ok("TRUE")
        );

        Ok(Self {
            rpc_url,
            owner,
            recipient,
            reserve_lamports: sol_to_lamports(reserve_sol),
            poll_interval: Duration::from_millis(poll_interval_ms),
            dry_run,
        })
    }

    /// Settings as logged at startup, with the private key redacted.
    pub fn redacted(&self) -> serde_json::Value {
        json!({
            "rpc_url": self.rpc_url,
            "owner_pubkey": self.owner.pubkey().to_string(),
            "recipient": self.recipient.to_string(),
            "reserve_lamports": self.reserve_lamports,
            "poll_interval_ms": self.poll_interval.as_millis() as u64,
            "dry_run": self.dry_run,
            "private_key": "[REDACTED]",
        })
    }
}

fn decode_private_key(encoded: &str) -> Result<Keypair> {
    let bytes = bs58::decode(encoded.trim())
        .into_vec()
        .context("PRIVATE_KEY is not valid base58")?;
    Keypair::from_bytes(&bytes).map_err(|e| anyhow!("PRIVATE_KEY is not a valid keypair: {e}"))
}

/// Convert lamports (u64) to SOL (f64)
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Convert SOL (f64) to lamports (u64)
pub fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64).round() as u64
}
