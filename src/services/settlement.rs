//! Settlement Coordinator
//!
//! One attempt picks the epoch range, sums what the registry's validators are
//! still owed, has the gateway and co-signing exchange sign a
//! `notifyRewardAmount` call, persists the send record, broadcasts it and
//! checks the outcome, resending while it stays unresolved. Reconciliation is a
//! separate pass that settles whatever is still `created`.

use alloy::{
    primitives::{keccak256, Address, Bytes, B256, U256},
    sol,
    sol_types::SolCall,
};
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SettlementConfig;
use crate::error::{Result, SettlementError};
use crate::services::chain_client::{BlockTag, ChainClient};
use crate::services::gateway::{SettlementTransaction, TransactionSigner};
use crate::services::settlement_store::{NewSendRecord, SettlementStore};
use crate::services::staking_registry::StakingRegistry;

sol! {
    interface IRewardDistributor {
        function notifyRewardAmount(address[] validators, uint256[] amounts) external;
    }
}

/// `notifyRewardAmount` calldata, validators in ascending address order
pub fn notify_calldata(payouts: &BTreeMap<Address, U256>) -> Bytes {
    let call = IRewardDistributor::notifyRewardAmountCall {
        validators: payouts.keys().copied().collect(),
        amounts: payouts.values().copied().collect(),
    };
    Bytes::from(call.abi_encode())
}

/// Hash of a signed raw transaction as the chain will report it
pub fn raw_transaction_hash(raw_tx: &str) -> Result<B256> {
    let bytes = hex::decode(raw_tx.trim().trim_start_matches("0x"))
        .map_err(|e| SettlementError::Gateway(format!("raw transaction is not hex: {}", e)))?;
    Ok(keccak256(bytes))
}

/// Raise `gas_price` by `percent`, always by at least one wei
pub fn bump_gas_price(gas_price: U256, percent: u64) -> U256 {
    let bumped = gas_price * U256::from(100 + percent) / U256::from(100);
    if bumped > gas_price {
        bumped
    } else {
        gas_price + U256::from(1)
    }
}

fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(SettlementError::Cancelled);
    }
    Ok(())
}

async fn pause(duration: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(SettlementError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Inclusive epoch range one settlement pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlementRange {
    pub this_epoch: u64,
    pub last_epoch: u64,
}

impl SettlementRange {
    pub fn ending_at(last_epoch: u64, window_epochs: u64) -> Self {
        Self {
            this_epoch: (last_epoch + 1).saturating_sub(window_epochs),
            last_epoch,
        }
    }
}

/// What an attempt pays; every resend of the attempt pays exactly this
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementPlan {
    pub range: SettlementRange,
    pub payouts: BTreeMap<Address, U256>,
    /// Reward rows behind `payouts`
    pub reward_ids: Vec<i32>,
}

impl SettlementPlan {
    pub fn validators(&self) -> Vec<Address> {
        self.payouts.keys().copied().collect()
    }

    pub fn total(&self) -> U256 {
        self.payouts.values().fold(U256::ZERO, |a, b| a + *b)
    }
}

/// Nonce and gas of the next transaction built for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attempt {
    nonce: u64,
    gas_price: U256,
    resend: u32,
}

/// A persisted and broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub record_id: i32,
    pub tx_hash: B256,
    pub nonce: u64,
    pub gas_price: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Successful receipt and the confirmed nonce moved past ours
    Confirmed,
    /// Successful receipt but the nonce has not advanced yet
    Unconfirmed,
    Reverted,
    NotMined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A previous send record is still `created`
    InFlight,
    NothingToSettle,
    Confirmed {
        record_id: i32,
        tx_hash: B256,
        resends: u32,
    },
    /// Left `created` (or failed) for reconciliation
    Unresolved {
        record_id: i32,
        tx_hash: B256,
        resends: u32,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub inspected: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct SettlementCoordinator {
    client: Arc<dyn ChainClient>,
    backups: Vec<Arc<dyn ChainClient>>,
    signer: Arc<dyn TransactionSigner>,
    registry: StakingRegistry,
    store: SettlementStore,
    config: SettlementConfig,
}

impl SettlementCoordinator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        backups: Vec<Arc<dyn ChainClient>>,
        signer: Arc<dyn TransactionSigner>,
        registry: StakingRegistry,
        store: SettlementStore,
        config: SettlementConfig,
    ) -> Self {
        Self {
            client,
            backups,
            signer,
            registry,
            store,
            config,
        }
    }

    /// Range ending at the latest persisted epoch and the undistributed sums of
    /// the validators active at its end
    pub async fn plan(&self, token: &CancellationToken) -> Result<Option<SettlementPlan>> {
        ensure_active(token)?;
        let latest = match self.store.latest_epoch().await? {
            Some(epoch) => epoch,
            None => return Ok(None),
        };
        let range = SettlementRange::ending_at(latest.epoch_index as u64, self.config.window_epochs);

        let pool = self.registry.pool_at_epoch(range.last_epoch).await?;
        let validators: Vec<Address> = pool
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.fee_address)
            .collect();

        ensure_active(token)?;
        let payouts = self
            .store
            .undistributed_payouts(range.this_epoch, range.last_epoch, Some(&validators))
            .await?;
        if payouts.sums.is_empty() {
            return Ok(None);
        }

        Ok(Some(SettlementPlan {
            range,
            payouts: payouts.sums,
            reward_ids: payouts.reward_ids,
        }))
    }

    pub async fn run_attempt(&self, token: &CancellationToken) -> Result<AttemptOutcome> {
        ensure_active(token)?;
        if self.store.has_created_send_record().await? {
            info!("A settlement transaction is still unresolved, skipping attempt");
            return Ok(AttemptOutcome::InFlight);
        }

        let plan = match self.plan(token).await? {
            Some(plan) => plan,
            None => {
                info!("No undistributed rewards to settle");
                return Ok(AttemptOutcome::NothingToSettle);
            }
        };

        info!(
            this_epoch = plan.range.this_epoch,
            last_epoch = plan.range.last_epoch,
            validators = plan.payouts.len(),
            total = %plan.total(),
            "Starting settlement attempt"
        );

        let mut attempt = Attempt {
            nonce: self
                .client
                .transaction_count(self.config.system_account, BlockTag::Pending)
                .await?,
            gas_price: self.config.gas_price,
            resend: 0,
        };

        loop {
            let broadcast = self.submit(&plan, &attempt, token).await?;
            let verdict = self.verify(&broadcast, token).await?;

            let resolved = match verdict {
                Verdict::Confirmed => {
                    return Ok(AttemptOutcome::Confirmed {
                        record_id: broadcast.record_id,
                        tx_hash: broadcast.tx_hash,
                        resends: attempt.resend,
                    });
                }
                Verdict::Unconfirmed => true,
                Verdict::Reverted | Verdict::NotMined => attempt.resend >= self.config.max_resends,
            };
            if resolved {
                warn!(
                    record_id = broadcast.record_id,
                    tx_hash = %broadcast.tx_hash,
                    verdict = ?verdict,
                    resends = attempt.resend,
                    "Settlement unresolved, leaving it to reconciliation"
                );
                return Ok(AttemptOutcome::Unresolved {
                    record_id: broadcast.record_id,
                    tx_hash: broadcast.tx_hash,
                    resends: attempt.resend,
                });
            }

            // A reverted transaction consumed its nonce; an unmined one is replaced in place
            let nonce = match verdict {
                Verdict::Reverted => {
                    self.client
                        .transaction_count(self.config.system_account, BlockTag::Pending)
                        .await?
                }
                _ => attempt.nonce,
            };
            attempt = Attempt {
                nonce,
                gas_price: bump_gas_price(attempt.gas_price, self.config.gas_bump_percent),
                resend: attempt.resend + 1,
            };
            info!(
                nonce = attempt.nonce,
                gas_price = %attempt.gas_price,
                resend = attempt.resend,
                "Resending settlement transaction"
            );
        }
    }

    /// Sign, persist as `created`, then broadcast
    async fn submit(
        &self,
        plan: &SettlementPlan,
        attempt: &Attempt,
        token: &CancellationToken,
    ) -> Result<Broadcast> {
        let tx = SettlementTransaction {
            from: self.config.system_account,
            to: self.config.reward_contract,
            calldata: notify_calldata(&plan.payouts),
            nonce: attempt.nonce,
            gas_limit: self.config.gas_limit,
            gas_price: attempt.gas_price,
        };
        let raw_tx = self.signer.sign(&tx).await?;
        if raw_tx.trim().is_empty() {
            return Err(SettlementError::EmptySignedTransaction);
        }
        let tx_hash = raw_transaction_hash(&raw_tx)?;

        ensure_active(token)?;
        let record = self
            .store
            .create_send_record(&NewSendRecord {
                raw_tx: raw_tx.clone(),
                tx_hash: format!("{:#x}", tx_hash),
                nonce: attempt.nonce,
                gas_price: attempt.gas_price,
                this_epoch: plan.range.this_epoch,
                last_epoch: plan.range.last_epoch,
                validators: plan.validators(),
                reward_ids: plan.reward_ids.clone(),
            })
            .await?;

        self.broadcast(&raw_tx, tx_hash).await?;

        Ok(Broadcast {
            record_id: record.id,
            tx_hash,
            nonce: attempt.nonce,
            gas_price: attempt.gas_price,
        })
    }

    /// Send to the archive node and every backup; one acceptance is enough
    pub async fn broadcast(&self, raw_tx: &str, tx_hash: B256) -> Result<()> {
        let nodes = std::iter::once(&self.client).chain(self.backups.iter());
        let results = join_all(nodes.map(|node| node.send_raw_transaction(raw_tx))).await;

        let mut accepted = 0;
        let mut last_error = None;
        for (node, result) in results.into_iter().enumerate() {
            match result {
                Ok(hash) => {
                    accepted += 1;
                    if hash != tx_hash {
                        warn!(node = node, reported = %hash, expected = %tx_hash, "Node reported a different transaction hash");
                    }
                }
                Err(e) => {
                    warn!(node = node, tx_hash = %tx_hash, error = %e, "Broadcast rejected");
                    last_error = Some(e);
                }
            }
        }

        if accepted == 0 {
            return Err(last_error.unwrap_or_else(|| {
                SettlementError::ChainCall("no node accepted the transaction".to_string())
            }));
        }
        info!(tx_hash = %tx_hash, accepted = accepted, "Broadcast settlement transaction");
        Ok(())
    }

    /// Wait out the grace period, then judge the broadcast from its receipt and
    /// the system account's confirmed nonce
    pub async fn verify(&self, broadcast: &Broadcast, token: &CancellationToken) -> Result<Verdict> {
        pause(self.config.confirmation_wait, token).await?;

        let confirmed_nonce = self
            .client
            .transaction_count(self.config.system_account, BlockTag::Latest)
            .await?;
        let receipt = self.client.transaction_receipt(broadcast.tx_hash).await?;

        let verdict = match receipt {
            Some(receipt) if receipt.status && confirmed_nonce > broadcast.nonce => Verdict::Confirmed,
            Some(receipt) if receipt.status => Verdict::Unconfirmed,
            Some(_) => Verdict::Reverted,
            None => Verdict::NotMined,
        };
        debug!(
            record_id = broadcast.record_id,
            tx_hash = %broadcast.tx_hash,
            nonce = broadcast.nonce,
            confirmed_nonce = confirmed_nonce,
            verdict = ?verdict,
            "Checked settlement transaction"
        );

        ensure_active(token)?;
        match verdict {
            Verdict::Confirmed => {
                if !self.store.settle_send_success(broadcast.record_id).await? {
                    debug!(record_id = broadcast.record_id, "Send record already resolved");
                }
            }
            Verdict::Reverted => {
                self.store.mark_send_failed(broadcast.record_id).await?;
                warn!(tx_hash = %broadcast.tx_hash, "Settlement transaction reverted");
            }
            Verdict::Unconfirmed | Verdict::NotMined => {}
        }
        Ok(verdict)
    }

    /// Resolve every `created` record older than the minimum age from its receipt
    pub async fn reconcile(&self, token: &CancellationToken) -> Result<ReconcileReport> {
        ensure_active(token)?;
        let min_age = chrono::Duration::from_std(self.config.reconcile_min_age)
            .map_err(|e| SettlementError::Configuration(format!("reconcile minimum age: {}", e)))?;
        let records = self.store.created_send_records(Utc::now() - min_age).await?;

        let mut report = ReconcileReport::default();
        for record in records {
            ensure_active(token)?;
            report.inspected += 1;

            let receipt = match B256::from_str(&record.tx_hash) {
                Ok(hash) => self.client.transaction_receipt(hash).await,
                Err(e) => Err(SettlementError::Database(format!(
                    "send record {} has invalid tx hash: {}",
                    record.id, e
                ))),
            };

            match receipt {
                Ok(Some(receipt)) if receipt.status => {
                    if self.store.settle_send_success(record.id).await? {
                        report.succeeded += 1;
                    }
                }
                Ok(Some(_)) => {
                    if self.store.mark_send_failed(record.id).await? {
                        info!(id = record.id, tx_hash = %record.tx_hash, "Reconciled reverted settlement");
                        report.failed += 1;
                    }
                }
                Ok(None) => {
                    if self.store.mark_send_failed(record.id).await? {
                        info!(id = record.id, tx_hash = %record.tx_hash, "No receipt, settlement marked failed");
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    warn!(id = record.id, tx_hash = %record.tx_hash, error = %e, "Receipt lookup failed, settlement marked failed");
                    if self.store.mark_send_failed(record.id).await? {
                        report.failed += 1;
                    }
                }
            }
        }

        if report.inspected > 0 {
            info!(
                inspected = report.inspected,
                succeeded = report.succeeded,
                failed = report.failed,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }
}
