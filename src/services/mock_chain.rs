//! In-memory `ChainClient` for unit tests

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, SettlementError};
use crate::services::chain_client::{
    BlockTag, BlockWithTransactions, ChainClient, TransactionInfo, TransactionReceipt,
};

#[derive(Default)]
pub struct MockChain {
    /// Successive `eth_blockNumber` answers; the last one repeats
    pub heights: Mutex<VecDeque<u64>>,
    pub blocks: Mutex<HashMap<u64, BlockWithTransactions>>,
    pub receipts: Mutex<HashMap<B256, TransactionReceipt>>,
    pub failing_blocks: Mutex<HashSet<u64>>,
    /// Calldata -> `eth_call` reply
    pub calls: Mutex<HashMap<Vec<u8>, Bytes>>,
    pub call_blocks: Mutex<Vec<BlockTag>>,
    pub latest_nonce: Mutex<u64>,
    pub pending_nonce: Mutex<u64>,
    pub sent: Mutex<Vec<String>>,
    /// Fate of each successive broadcast: mined with this status, or `None` for never mined
    pub send_outcomes: Mutex<VecDeque<Option<bool>>>,
    pub receipt_batches: AtomicUsize,
    pub height_requests: AtomicUsize,
}

pub fn tx_hash(block: u64, index: usize) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&block.to_be_bytes());
    bytes[24..].copy_from_slice(&(index as u64).to_be_bytes());
    B256::from(bytes)
}

impl MockChain {
    pub fn with_heights(heights: &[u64]) -> Self {
        let chain = Self::default();
        chain.heights.lock().unwrap().extend(heights.iter().copied());
        chain
    }

    /// Add a block whose transactions pay `(gas_price, gas_used)`
    pub fn add_block(&self, number: u64, txs: &[(u64, u64)]) {
        let mut transactions = Vec::new();
        let mut receipts = self.receipts.lock().unwrap();
        for (i, (gas_price, gas_used)) in txs.iter().enumerate() {
            let hash = tx_hash(number, i);
            transactions.push(TransactionInfo {
                hash,
                gas_price: Some(U256::from(*gas_price)),
            });
            receipts.insert(
                hash,
                TransactionReceipt {
                    transaction_hash: hash,
                    status: true,
                    gas_used: U256::from(*gas_used),
                    effective_gas_price: None,
                    block_number: Some(number),
                },
            );
        }
        self.blocks
            .lock()
            .unwrap()
            .insert(number, BlockWithTransactions { number, transactions });
    }

    pub fn fail_block(&self, number: u64) {
        self.failing_blocks.lock().unwrap().insert(number);
    }

    pub fn set_receipt(&self, hash: B256, status: bool) {
        self.receipts.lock().unwrap().insert(
            hash,
            TransactionReceipt {
                transaction_hash: hash,
                status,
                gas_used: U256::from(21000),
                effective_gas_price: None,
                block_number: Some(1),
            },
        );
    }

    pub fn set_call(&self, calldata: Vec<u8>, reply: Vec<u8>) {
        self.calls.lock().unwrap().insert(calldata, Bytes::from(reply));
    }

    pub fn push_send_outcome(&self, outcome: Option<bool>) {
        self.send_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn set_nonces(&self, latest: u64, pending: u64) {
        *self.latest_nonce.lock().unwrap() = latest;
        *self.pending_nonce.lock().unwrap() = pending;
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        self.height_requests.fetch_add(1, Ordering::SeqCst);
        let mut heights = self.heights.lock().unwrap();
        match heights.len() {
            0 => Err(SettlementError::ChainCall("no height configured".into())),
            1 => Ok(heights[0]),
            _ => Ok(heights.pop_front().unwrap_or_default()),
        }
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockWithTransactions>> {
        if self.failing_blocks.lock().unwrap().contains(&number) {
            return Err(SettlementError::ChainCall(format!("block {} unavailable", number)));
        }
        Ok(Some(
            self.blocks
                .lock()
                .unwrap()
                .get(&number)
                .cloned()
                .unwrap_or(BlockWithTransactions { number, transactions: Vec::new() }),
        ))
    }

    async fn transaction_receipts(&self, hashes: &[B256]) -> Result<Vec<Option<TransactionReceipt>>> {
        self.receipt_batches.fetch_add(1, Ordering::SeqCst);
        let receipts = self.receipts.lock().unwrap();
        Ok(hashes.iter().map(|h| receipts.get(h).cloned()).collect())
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn transaction_count(&self, _address: Address, block: BlockTag) -> Result<u64> {
        Ok(match block {
            BlockTag::Pending => *self.pending_nonce.lock().unwrap(),
            _ => *self.latest_nonce.lock().unwrap(),
        })
    }

    async fn call(&self, _to: Address, data: Bytes, block: BlockTag) -> Result<Bytes> {
        self.call_blocks.lock().unwrap().push(block);
        self.calls
            .lock()
            .unwrap()
            .get(&data[..])
            .cloned()
            .ok_or_else(|| SettlementError::ChainCall("execution reverted".into()))
    }

    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<B256> {
        let bytes = hex::decode(raw_tx.trim_start_matches("0x"))
            .map_err(|e| SettlementError::ChainCall(format!("invalid raw transaction: {}", e)))?;
        let hash = keccak256(&bytes);
        self.sent.lock().unwrap().push(raw_tx.to_string());

        if let Some(Some(status)) = self.send_outcomes.lock().unwrap().pop_front() {
            self.set_receipt(hash, status);
            *self.latest_nonce.lock().unwrap() += 1;
            *self.pending_nonce.lock().unwrap() += 1;
        }
        Ok(hash)
    }
}
