//! The drain loop: poll, transfer, sleep, forever.

use std::time::Duration;

use anyhow::Result;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_sdk::{
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
};
use solana_system_interface::instruction as system_instruction;
use spl_token::instruction::transfer_checked;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::{lamports_to_sol, Settings};
use crate::ledger::{LedgerClient, TokenHolding};

/// Priority fee attached to every submission, in micro-lamports per
/// compute unit.
const COMPUTE_UNIT_PRICE: u64 = 100;

/// Compute unit limit attached to every native sweep.
const COMPUTE_UNIT_LIMIT: u32 = 500_000;

/// Outcome of the native half of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeSweep {
    /// Balance exceeded the reserve and a transfer went out.
    Swept {
        lamports: u64,
        signature: Option<Signature>,
    },
    /// Balance at or below the reserve; nothing to do.
    BelowReserve { lamports: u64 },
}

/// One issued (or dry-run) token transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSweep {
    pub mint: Pubkey,
    pub base_units: u64,
    pub signature: Option<Signature>,
}

/// Everything that happened in one iteration. The loop logs it; tests
/// assert on it directly instead of needing a live network.
#[derive(Debug, Default)]
pub struct IterationReport {
    /// `None` when the balance query or the submission failed.
    pub native: Option<NativeSweep>,
    pub tokens: Vec<TokenSweep>,
    /// Messages of every swallowed failure, in the order they occurred.
    pub failures: Vec<String>,
}

/// Owns the ledger client and the account identity for the lifetime of
/// the process.
pub struct Sweeper<L> {
    ledger: L,
    owner: Keypair,
    recipient: Pubkey,
    reserve_lamports: u64,
    poll_interval: Duration,
    dry_run: bool,
}

impl<L: LedgerClient> Sweeper<L> {
    pub fn new(ledger: L, settings: Settings) -> Self {
        Self {
            ledger,
            owner: settings.owner,
            recipient: settings.recipient,
            reserve_lamports: settings.reserve_lamports,
            poll_interval: settings.poll_interval,
            dry_run: settings.dry_run,
        }
    }

    /// Polls and sweeps until the process is killed.
    pub async fn run(self) {
        loop {
            let report = self.run_once().await;
            info!(
                native_swept = matches!(report.native, Some(NativeSweep::Swept { .. })),
                token_transfers = report.tokens.len(),
                failures = report.failures.len(),
                "iteration complete; waiting for next pass"
            );
            sleep(self.poll_interval).await;
        }
    }

    /// One pass: native sweep, then every token holding. Every ledger
    /// operation is guarded individually; a failure is recorded and the
    /// pass moves on to the next independent step.
    pub async fn run_once(&self) -> IterationReport {
        let mut report = IterationReport::default();

        match self.sweep_native().await {
            Ok(native) => {
                if let NativeSweep::Swept { lamports, signature } = &native {
                    match signature {
                        Some(signature) => {
                            info!(%signature, lamports = *lamports, "native transfer submitted")
                        }
                        None => info!(lamports = *lamports, "dry run; native transfer skipped"),
                    }
                }
                report.native = Some(native);
            }
            Err(err) => {
                error!("native sweep failed: {err:#}");
                report.failures.push(format!("native sweep: {err:#}"));
            }
        }

        let holdings = match self.ledger.token_holdings(&self.owner.pubkey()).await {
            Ok(holdings) => holdings,
            Err(err) => {
                error!("listing token holdings failed: {err:#}");
                report.failures.push(format!("token holdings: {err:#}"));
                Vec::new()
            }
        };

        for holding in holdings {
            if holding.amount <= 0.0 {
                continue;
            }
            match self.sweep_token(&holding).await {
                Ok(sweep) => {
                    match &sweep.signature {
                        Some(signature) => info!(
                            %signature,
                            mint = %sweep.mint,
                            base_units = sweep.base_units,
                            "token transfer submitted"
                        ),
                        None => info!(
                            mint = %sweep.mint,
                            base_units = sweep.base_units,
                            "dry run; token transfer skipped"
                        ),
                    }
                    report.tokens.push(sweep);
                }
                Err(err) => {
                    error!(mint = %holding.mint, "token sweep failed: {err:#}");
                    report.failures.push(format!("token {}: {err:#}", holding.mint));
                }
            }
        }

        report
    }

    async fn sweep_native(&self) -> Result<NativeSweep> {
        let owner = self.owner.pubkey();
        let balance = self.ledger.balance(&owner).await?;
        info!(
            lamports = balance,
            sol = lamports_to_sol(balance),
            "current native balance"
        );

        let transferable = balance.saturating_sub(self.reserve_lamports);
        if transferable == 0 {
            info!("balance at or below the fee reserve; nothing to sweep");
            return Ok(NativeSweep::BelowReserve { lamports: balance });
        }

        let instructions = [
            ComputeBudgetInstruction::set_compute_unit_price(COMPUTE_UNIT_PRICE),
            ComputeBudgetInstruction::set_compute_unit_limit(COMPUTE_UNIT_LIMIT),
            system_instruction::transfer(&owner, &self.recipient, transferable),
        ];
        let signature = self.dispatch(&instructions).await?;
        Ok(NativeSweep::Swept {
            lamports: transferable,
            signature,
        })
    }

    async fn sweep_token(&self, holding: &TokenHolding) -> Result<TokenSweep> {
        let destination = self
            .ledger
            .recipient_token_account(&self.owner, &holding.mint, &self.recipient)
            .await?;

        let base_units = holding.base_units();
        let transfer_ix = transfer_checked(
            &spl_token::ID,
            &holding.account,
            &holding.mint,
            &destination,
            &self.owner.pubkey(),
            &[],
            base_units,
            holding.decimals,
        )?;

        let signature = self.dispatch(&[transfer_ix]).await?;
        Ok(TokenSweep {
            mint: holding.mint,
            base_units,
            signature,
        })
    }

    /// Submits unless dry-running.
    async fn dispatch(&self, instructions: &[Instruction]) -> Result<Option<Signature>> {
        if self.dry_run {
            return Ok(None);
        }
        Ok(Some(self.ledger.submit(instructions, &self.owner).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sol_to_lamports;
    use anyhow::anyhow;
    use spl_associated_token_account::get_associated_token_address;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    #[derive(Default)]
    struct FakeState {
        /// `None` makes the balance query fail.
        balance: Option<u64>,
        /// `None` makes the token listing fail.
        holdings: Option<Vec<TokenHolding>>,
        /// Fail the next N submissions before accepting any.
        failing_submits: Mutex<usize>,
        submissions: Mutex<Vec<Vec<Instruction>>>,
        balance_calls: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct FakeLedger(Arc<FakeState>);

    impl LedgerClient for FakeLedger {
        async fn balance(&self, _address: &Pubkey) -> Result<u64> {
            self.0.balance_calls.fetch_add(1, Ordering::SeqCst);
            self.0
                .balance
                .ok_or_else(|| anyhow!("rpc: balance unavailable"))
        }

        async fn token_holdings(&self, _owner: &Pubkey) -> Result<Vec<TokenHolding>> {
            self.0
                .holdings
                .clone()
                .ok_or_else(|| anyhow!("rpc: token query failed"))
        }

        async fn recipient_token_account(
            &self,
            _payer: &Keypair,
            mint: &Pubkey,
            recipient: &Pubkey,
        ) -> Result<Pubkey> {
            Ok(get_associated_token_address(recipient, mint))
        }

        async fn submit(
            &self,
            instructions: &[Instruction],
            _signer: &Keypair,
        ) -> Result<Signature> {
            {
                let mut failing = self.0.failing_submits.lock().unwrap();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(anyhow!("rpc: submission rejected"));
                }
            }
            self.0
                .submissions
                .lock()
                .unwrap()
                .push(instructions.to_vec());
            Ok(Signature::default())
        }
    }

    fn sweeper(state: FakeState) -> (Sweeper<FakeLedger>, Arc<FakeState>) {
        let ledger = FakeLedger(Arc::new(state));
        let state = ledger.0.clone();
        let settings = Settings {
            rpc_url: "http://localhost:8899".into(),
            owner: Keypair::new(),
            recipient: Pubkey::new_unique(),
            reserve_lamports: sol_to_lamports(0.005),
            poll_interval: Duration::from_millis(1_000),
            dry_run: false,
        };
        (Sweeper::new(ledger, settings), state)
    }

    #[tokio::test]
    async fn keeps_the_fee_reserve_when_balance_is_too_low() {
        let (sweeper, state) = sweeper(FakeState {
            balance: Some(sol_to_lamports(0.005)),
            holdings: Some(Vec::new()),
            ..Default::default()
        });

        let report = sweeper.run_once().await;

        assert_eq!(
            report.native,
            Some(NativeSweep::BelowReserve {
                lamports: 5_000_000
            })
        );
        assert!(report.failures.is_empty());
        assert!(state.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweeps_everything_above_the_reserve() {
        let (sweeper, state) = sweeper(FakeState {
            balance: Some(sol_to_lamports(1.2)),
            holdings: Some(Vec::new()),
            ..Default::default()
        });

        let report = sweeper.run_once().await;

        assert_eq!(
            report.native,
            Some(NativeSweep::Swept {
                lamports: 1_195_000_000,
                signature: Some(Signature::default()),
            })
        );
        let submissions = state.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        let instructions = &submissions[0];
        assert_eq!(instructions.len(), 3);
        assert_eq!(
            instructions[0],
            ComputeBudgetInstruction::set_compute_unit_price(COMPUTE_UNIT_PRICE)
        );
        assert_eq!(
            instructions[1],
            ComputeBudgetInstruction::set_compute_unit_limit(COMPUTE_UNIT_LIMIT)
        );
        assert_eq!(
            instructions[2],
            system_instruction::transfer(
                &sweeper.owner.pubkey(),
                &sweeper.recipient,
                1_195_000_000
            )
        );
    }

    #[tokio::test]
    async fn transfers_each_nonzero_token_holding_in_full() {
        let usdc_mint = Pubkey::new_unique();
        let usdc_account = Pubkey::new_unique();
        let (sweeper, state) = sweeper(FakeState {
            balance: Some(0),
            holdings: Some(vec![
                TokenHolding {
                    mint: Pubkey::new_unique(),
                    account: Pubkey::new_unique(),
                    amount: 0.0,
                    decimals: 9,
                },
                TokenHolding {
                    mint: usdc_mint,
                    account: usdc_account,
                    amount: 50.0,
                    decimals: 6,
                },
            ]),
            ..Default::default()
        });

        let report = sweeper.run_once().await;

        assert_eq!(report.tokens.len(), 1);
        assert_eq!(report.tokens[0].mint, usdc_mint);
        assert_eq!(report.tokens[0].base_units, 50_000_000);

        let submissions = state.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        let destination = get_associated_token_address(&sweeper.recipient, &usdc_mint);
        let expected = transfer_checked(
            &spl_token::ID,
            &usdc_account,
            &usdc_mint,
            &destination,
            &sweeper.owner.pubkey(),
            &[],
            50_000_000,
            6,
        )
        .unwrap();
        assert_eq!(submissions[0], vec![expected]);
    }

    #[tokio::test]
    async fn a_failed_balance_query_does_not_stop_token_sweeps() {
        let (sweeper, state) = sweeper(FakeState {
            balance: None,
            holdings: Some(vec![TokenHolding {
                mint: Pubkey::new_unique(),
                account: Pubkey::new_unique(),
                amount: 1.5,
                decimals: 9,
            }]),
            ..Default::default()
        });

        let report = sweeper.run_once().await;

        assert_eq!(report.native, None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.tokens.len(), 1);
        assert_eq!(report.tokens[0].base_units, 1_500_000_000);
        assert_eq!(state.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_rejected_native_submission_does_not_stop_token_sweeps() {
        let (sweeper, state) = sweeper(FakeState {
            balance: Some(sol_to_lamports(1.0)),
            holdings: Some(vec![TokenHolding {
                mint: Pubkey::new_unique(),
                account: Pubkey::new_unique(),
                amount: 2.0,
                decimals: 6,
            }]),
            failing_submits: Mutex::new(1),
            ..Default::default()
        });

        let report = sweeper.run_once().await;

        assert_eq!(report.native, None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.tokens.len(), 1);
        assert_eq!(report.tokens[0].base_units, 2_000_000);
        // Only the token transfer landed.
        assert_eq!(state.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_transfers_without_submitting() {
        let (mut sweeper, state) = sweeper(FakeState {
            balance: Some(sol_to_lamports(1.2)),
            holdings: Some(vec![TokenHolding {
                mint: Pubkey::new_unique(),
                account: Pubkey::new_unique(),
                amount: 50.0,
                decimals: 6,
            }]),
            ..Default::default()
        });
        sweeper.dry_run = true;

        let report = sweeper.run_once().await;

        assert_eq!(
            report.native,
            Some(NativeSweep::Swept {
                lamports: 1_195_000_000,
                signature: None,
            })
        );
        assert_eq!(report.tokens.len(), 1);
        assert_eq!(report.tokens[0].signature, None);
        assert!(state.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn iterations_are_spaced_by_the_poll_interval() {
        let (sweeper, state) = sweeper(FakeState {
            balance: Some(0),
            holdings: Some(Vec::new()),
            ..Default::default()
        });

        tokio::spawn(sweeper.run());
        // Paused clock: sleeps auto-advance deterministically, so 3.5
        // intervals give exactly the iterations at t = 0s, 1s, 2s, 3s.
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(state.balance_calls.load(Ordering::SeqCst), 4);
    }
}
