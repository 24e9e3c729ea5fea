//! Thin wrapper over the Solana RPC surface the sweep loop consumes.

use anyhow::{Context, Result};
use serde::Deserialize;
use solana_account_decoder::UiAccountData;
use solana_client::{nonblocking::rpc_client::RpcClient, rpc_request::TokenAccountsFilter};
use solana_commitment_config::CommitmentConfig;
use solana_sdk::{
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use tracing::{info, warn};

/// One SPL token account owned by the swept wallet, as reported by the
/// parsed-account query. Re-fetched every iteration, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenHolding {
    pub mint: Pubkey,
    /// The owner's token account holding the balance.
    pub account: Pubkey,
    /// Balance in UI units.
    pub amount: f64,
    pub decimals: u8,
}

impl TokenHolding {
    /// Balance in base units of the mint.
    pub fn base_units(&self) -> u64 {
        (self.amount * 10f64.powi(self.decimals as i32)).floor() as u64
    }
}

/// `parsed` payload of a token account under jsonParsed encoding.
#[derive(Debug, Deserialize)]
struct ParsedTokenData {
    info: ParsedTokenInfo,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenInfo {
    mint: String,
    #[serde(rename = "tokenAmount")]
    token_amount: ParsedTokenAmount,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenAmount {
    #[serde(rename = "uiAmount")]
    ui_amount: Option<f64>,
    decimals: u8,
}

/// The ledger operations the sweep loop needs. Implemented by the RPC
/// client in production and by a recording fake in tests.
pub trait LedgerClient {
    /// Native balance of `address`, in lamports.
    async fn balance(&self, address: &Pubkey) -> Result<u64>;

    /// Every SPL token account owned by `owner`.
    async fn token_holdings(&self, owner: &Pubkey) -> Result<Vec<TokenHolding>>;

    /// Resolves the recipient's associated token account for `mint`,
    /// creating it (funded by `payer`) if it does not exist yet.
    async fn recipient_token_account(
        &self,
        payer: &Keypair,
        mint: &Pubkey,
        recipient: &Pubkey,
    ) -> Result<Pubkey>;

    /// Signs and submits a transaction with `signer` as fee payer.
    async fn submit(&self, instructions: &[Instruction], signer: &Keypair) -> Result<Signature>;
}

/// `LedgerClient` backed by a remote Solana RPC node.
pub struct SolanaLedger {
    rpc: RpcClient,
}

impl SolanaLedger {
    pub fn new(rpc_url: String) -> Self {
        // `processed` keeps the polling loop close to the tip.
        let rpc = RpcClient::new_with_commitment(rpc_url, CommitmentConfig::processed());
        Self { rpc }
    }
}

impl LedgerClient for SolanaLedger {
    async fn balance(&self, address: &Pubkey) -> Result<u64> {
        self.rpc
            .get_balance(address)
            .await
            .context("querying balance")
    }

    async fn token_holdings(&self, owner: &Pubkey) -> Result<Vec<TokenHolding>> {
        let accounts = self
            .rpc
            .get_token_accounts_by_owner(owner, TokenAccountsFilter::ProgramId(spl_token::ID))
            .await
            .context("listing token accounts")?;

        let mut holdings = Vec::with_capacity(accounts.len());
        for keyed in accounts {
            let UiAccountData::Json(parsed) = keyed.account.data else {
                warn!(account = %keyed.pubkey, "token account data not in parsed form; skipping");
                continue;
            };
            let data: ParsedTokenData =
                serde_json::from_value(parsed.parsed).context("decoding parsed token account")?;
            holdings.push(TokenHolding {
                mint: data.info.mint.parse().context("parsing token mint")?,
                account: keyed
                    .pubkey
                    .parse()
                    .context("parsing token account address")?,
                amount: data.info.token_amount.ui_amount.unwrap_or(0.0),
                decimals: data.info.token_amount.decimals,
            });
        }
        Ok(holdings)
    }

    async fn recipient_token_account(
        &self,
        payer: &Keypair,
        mint: &Pubkey,
        recipient: &Pubkey,
    ) -> Result<Pubkey> {
        let ata = get_associated_token_address(recipient, mint);
        if self.rpc.get_account(&ata).await.is_ok() {
            return Ok(ata);
        }

        // Idempotent create: harmless if the account appears between the
        // probe and the submission.
        let create_ix = create_associated_token_account_idempotent(
            &payer.pubkey(),
            recipient,
            mint,
            &spl_token::ID,
        );
        let signature = self
            .submit(&[create_ix], payer)
            .await
            .context("creating recipient token account")?;
        info!(%signature, %mint, "created recipient token account");
        Ok(ata)
    }

    async fn submit(&self, instructions: &[Instruction], signer: &Keypair) -> Result<Signature> {
        let recent_blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .context("fetching recent blockhash")?;
        let tx = Transaction::new_signed_with_payer(
            instructions,
            Some(&signer.pubkey()),
            &[signer],
            recent_blockhash,
        );
        self.rpc
            .send_transaction(&tx)
            .await
            .context("sending transaction")
    }
}
