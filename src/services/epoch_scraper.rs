//! Epoch Scraper
//!
//! Turns the archive node's height into the most recent fully elapsed epoch
//! window, keeping clear of the epoch boundary while it may still reorg, and
//! sums the transaction fees paid inside a window.

use alloy::primitives::U256;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SettlementError};
use crate::services::chain_client::ChainClient;

/// Blocks fetched concurrently while aggregating one epoch
const BLOCK_FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochTiming {
    /// Blocks per epoch
    pub epoch_length: u64,
    /// Heights within this many blocks past a boundary are not trusted yet
    pub reorg_margin: u64,
    pub reorg_wait: Duration,
}

impl Default for EpochTiming {
    fn default() -> Self {
        Self {
            epoch_length: 200,
            reorg_margin: 10,
            reorg_wait: Duration::from_secs(30),
        }
    }
}

/// Inclusive block range of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EpochWindow {
    pub epoch_index: u64,
    pub first_block: u64,
    pub last_block: u64,
}

impl EpochWindow {
    pub fn for_index(epoch_index: u64, epoch_length: u64) -> Self {
        let first_block = epoch_index * epoch_length;
        Self {
            epoch_index,
            first_block,
            last_block: first_block + epoch_length - 1,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.last_block - self.first_block + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochFees {
    pub window: EpochWindow,
    pub total_fees: U256,
    /// Blocks whose fees could not be fetched and are missing from the total
    pub skipped_blocks: Vec<u64>,
}

pub fn is_near_boundary(height: u64, timing: &EpochTiming) -> bool {
    height % timing.epoch_length < timing.reorg_margin
}

/// Last complete epoch strictly before the epoch containing `height`
pub fn settleable_window(height: u64, timing: &EpochTiming) -> Option<EpochWindow> {
    let boundary = height - height % timing.epoch_length;
    if boundary < timing.epoch_length {
        return None;
    }
    Some(EpochWindow::for_index(
        boundary / timing.epoch_length - 1,
        timing.epoch_length,
    ))
}

pub struct EpochScraper {
    client: Arc<dyn ChainClient>,
    timing: EpochTiming,
}

impl EpochScraper {
    pub fn new(client: Arc<dyn ChainClient>, timing: EpochTiming) -> Self {
        Self { client, timing }
    }

    pub fn timing(&self) -> &EpochTiming {
        &self.timing
    }

    /// Current settleable epoch, waiting once if the tip sits right after a boundary
    pub async fn current_epoch(&self, token: &CancellationToken) -> Result<EpochWindow> {
        let mut height = self.client.block_number().await?;

        if is_near_boundary(height, &self.timing) {
            info!(
                height = height,
                wait_secs = self.timing.reorg_wait.as_secs(),
                "Chain tip too close to epoch boundary, waiting before re-check"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(SettlementError::Cancelled),
                _ = tokio::time::sleep(self.timing.reorg_wait) => {}
            }

            height = self.client.block_number().await?;
            if is_near_boundary(height, &self.timing) {
                warn!(height = height, "Chain tip still inside reorg margin, aborting cycle");
                return Err(SettlementError::ChainUnstable { height });
            }
        }

        settleable_window(height, &self.timing).ok_or_else(|| {
            SettlementError::ChainCall(format!("no completed epoch at height {}", height))
        })
    }

    pub async fn scrape_epoch(&self, epoch_index: u64) -> Result<EpochFees> {
        self.epoch_fees(EpochWindow::for_index(epoch_index, self.timing.epoch_length))
            .await
    }

    /// Sum fees over every block of the window; unreadable blocks are skipped and reported
    pub async fn epoch_fees(&self, window: EpochWindow) -> Result<EpochFees> {
        let results: Vec<(u64, Result<U256>)> = stream::iter((window.first_block..=window.last_block).rev())
            .map(|number| async move { (number, self.block_fees(number).await) })
            .buffered(BLOCK_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut total_fees = U256::ZERO;
        let mut skipped_blocks = Vec::new();
        for (number, result) in results {
            match result {
                Ok(fees) => total_fees += fees,
                Err(e) => {
                    warn!(
                        epoch_index = window.epoch_index,
                        block = number,
                        error = %e,
                        "Skipping block in fee aggregation"
                    );
                    skipped_blocks.push(number);
                }
            }
        }

        if skipped_blocks.len() as u64 == window.block_count() {
            return Err(SettlementError::ChainCall(format!(
                "no block of epoch {} could be fetched",
                window.epoch_index
            )));
        }

        info!(
            epoch_index = window.epoch_index,
            first_block = window.first_block,
            last_block = window.last_block,
            total_fees = %total_fees,
            skipped = skipped_blocks.len(),
            "Aggregated epoch fees"
        );

        Ok(EpochFees {
            window,
            total_fees,
            skipped_blocks,
        })
    }

    /// Fees of one block: sum of gas price times gas used, receipts fetched in one batch
    pub async fn block_fees(&self, number: u64) -> Result<U256> {
        let block = self
            .client
            .block_with_transactions(number)
            .await?
            .ok_or_else(|| SettlementError::ChainCall(format!("block {} not found", number)))?;

        if block.transactions.is_empty() {
            return Ok(U256::ZERO);
        }

        let hashes: Vec<_> = block.transactions.iter().map(|tx| tx.hash).collect();
        let receipts = self.client.transaction_receipts(&hashes).await?;

        let mut fees = U256::ZERO;
        for (tx, receipt) in block.transactions.iter().zip(receipts) {
            let receipt = receipt.ok_or_else(|| {
                SettlementError::ChainCall(format!("missing receipt for {:#x}", tx.hash))
            })?;
            let gas_price = tx
                .gas_price
                .or(receipt.effective_gas_price)
                .ok_or_else(|| {
                    SettlementError::ChainCall(format!("no gas price for {:#x}", tx.hash))
                })?;
            fees += gas_price * receipt.gas_used;
        }

        debug!(block = number, tx_count = hashes.len(), fees = %fees, "Block fees");
        Ok(fees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock_chain::MockChain;
    use std::sync::atomic::Ordering;

    fn timing() -> EpochTiming {
        EpochTiming {
            reorg_wait: Duration::ZERO,
            ..EpochTiming::default()
        }
    }

    #[test]
    fn test_window_for_index() {
        let window = EpochWindow::for_index(100, 200);
        assert_eq!(window.first_block, 20_000);
        assert_eq!(window.last_block, 20_199);
        assert_eq!(window.block_count(), 200);
    }

    #[test]
    fn test_settleable_window_math() {
        let t = timing();
        // H = 20250: r = 50, last = 20199, first = 20000, index = 100
        let window = settleable_window(20_250, &t).unwrap();
        assert_eq!(window, EpochWindow::for_index(100, 200));
        assert_eq!(window.last_block, 20_250 - 50 - 1);

        assert!(is_near_boundary(20_205, &t));
        assert!(!is_near_boundary(20_210, &t));
        assert!(settleable_window(150, &t).is_none());
    }

    #[tokio::test]
    async fn test_current_epoch_without_wait() {
        let chain = Arc::new(MockChain::with_heights(&[20_250]));
        let scraper = EpochScraper::new(chain.clone(), timing());

        let window = scraper.current_epoch(&CancellationToken::new()).await.unwrap();
        assert_eq!(window.epoch_index, 100);
        assert_eq!(chain.height_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reorg_guard_rechecks_then_proceeds() {
        // H mod 200 = 5 first, then the chain moves past the margin
        let chain = Arc::new(MockChain::with_heights(&[20_205, 20_215]));
        let scraper = EpochScraper::new(chain.clone(), timing());

        let window = scraper.current_epoch(&CancellationToken::new()).await.unwrap();
        assert_eq!(window.epoch_index, 100);
        assert_eq!(chain.height_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reorg_guard_aborts_when_still_close() {
        let chain = Arc::new(MockChain::with_heights(&[20_205, 20_207]));
        let scraper = EpochScraper::new(chain.clone(), timing());

        let err = scraper.current_epoch(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SettlementError::ChainUnstable { height: 20_207 }));
        assert_eq!(chain.height_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reorg_wait_stops_on_cancellation() {
        let chain = Arc::new(MockChain::with_heights(&[20_205, 20_215]));
        let slow = EpochTiming {
            reorg_wait: Duration::from_secs(3600),
            ..EpochTiming::default()
        };
        let scraper = EpochScraper::new(chain.clone(), slow);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = scraper.current_epoch(&token).await.unwrap_err();
        assert!(matches!(err, SettlementError::Cancelled));
        assert_eq!(chain.height_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_epoch_fees_sum_all_blocks_with_one_batch_per_block() {
        let chain = Arc::new(MockChain::default());
        chain.add_block(400, &[(10, 21_000), (20, 50_000)]);
        chain.add_block(599, &[(5, 100)]);
        let scraper = EpochScraper::new(chain.clone(), timing());

        let fees = scraper.scrape_epoch(2).await.unwrap();
        assert_eq!(fees.window.first_block, 400);
        assert_eq!(fees.window.last_block, 599);
        assert_eq!(fees.total_fees, U256::from(10 * 21_000 + 20 * 50_000 + 5 * 100));
        assert!(fees.skipped_blocks.is_empty());
        // Empty blocks never issue a receipt request
        assert_eq!(chain.receipt_batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_block_is_skipped_not_fatal() {
        let chain = Arc::new(MockChain::default());
        chain.add_block(400, &[(10, 1_000)]);
        chain.add_block(401, &[(10, 2_000)]);
        chain.fail_block(401);
        let scraper = EpochScraper::new(chain, timing());

        let fees = scraper.scrape_epoch(2).await.unwrap();
        assert_eq!(fees.total_fees, U256::from(10_000));
        assert_eq!(fees.skipped_blocks, vec![401]);
    }

    #[tokio::test]
    async fn test_epoch_with_no_readable_block_fails() {
        let chain = Arc::new(MockChain::default());
        let small = EpochTiming {
            epoch_length: 2,
            reorg_margin: 1,
            reorg_wait: Duration::ZERO,
        };
        chain.fail_block(4);
        chain.fail_block(5);
        let scraper = EpochScraper::new(chain, small);

        assert!(matches!(
            scraper.scrape_epoch(2).await,
            Err(SettlementError::ChainCall(_))
        ));
    }

    #[tokio::test]
    async fn test_gas_price_falls_back_to_effective_price() {
        let chain = Arc::new(MockChain::default());
        chain.add_block(7, &[(0, 0)]);
        {
            let mut blocks = chain.blocks.lock().unwrap();
            let block = blocks.get_mut(&7).unwrap();
            block.transactions[0].gas_price = None;
            let mut receipts = chain.receipts.lock().unwrap();
            let receipt = receipts.get_mut(&block.transactions[0].hash).unwrap();
            receipt.gas_used = U256::from(3);
            receipt.effective_gas_price = Some(U256::from(7));
        }
        let scraper = EpochScraper::new(chain, timing());

        assert_eq!(scraper.block_fees(7).await.unwrap(), U256::from(21));
    }
}
