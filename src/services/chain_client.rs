//! Archive node access
//!
//! Only the handful of calls the settlement pipeline needs: height, blocks with
//! full transactions, receipts (single and batched), nonces, `eth_call` and raw
//! transaction broadcast. Typed calls go through an alloy provider; block and
//! receipt reads decode just the fields fee aggregation needs.

use alloy::{
    primitives::{Address, Bytes, B256, U256, U64},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::{
        client::RpcClient,
        types::{BlockId, BlockNumberOrTag, TransactionInput, TransactionRequest},
    },
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SettlementError};

/// Block selector for state queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Number(u64),
}

impl From<BlockTag> for BlockId {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Latest => BlockId::Number(BlockNumberOrTag::Latest),
            BlockTag::Pending => BlockId::Number(BlockNumberOrTag::Pending),
            BlockTag::Number(n) => BlockId::Number(BlockNumberOrTag::Number(n)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub hash: B256,
    pub gas_price: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWithTransactions {
    pub number: u64,
    pub transactions: Vec<TransactionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    /// `true` when the receipt status is 0x1
    pub status: bool,
    pub gas_used: U256,
    pub effective_gas_price: Option<U256>,
    pub block_number: Option<u64>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockWithTransactions>>;

    /// Receipts for all hashes in one round trip, in the order requested
    async fn transaction_receipts(&self, hashes: &[B256]) -> Result<Vec<Option<TransactionReceipt>>>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>>;

    async fn transaction_count(&self, address: Address, block: BlockTag) -> Result<u64>;

    async fn call(&self, to: Address, data: Bytes, block: BlockTag) -> Result<Bytes>;

    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<B256>;
}

#[derive(Debug, Deserialize)]
struct NodeBlock {
    number: U64,
    #[serde(default)]
    transactions: Vec<NodeTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeTransaction {
    hash: B256,
    #[serde(default)]
    gas_price: Option<U256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeReceipt {
    transaction_hash: B256,
    #[serde(default)]
    status: Option<U64>,
    gas_used: U256,
    #[serde(default)]
    effective_gas_price: Option<U256>,
    #[serde(default)]
    block_number: Option<U64>,
}

impl From<NodeReceipt> for TransactionReceipt {
    fn from(receipt: NodeReceipt) -> Self {
        TransactionReceipt {
            transaction_hash: receipt.transaction_hash,
            status: receipt.status == Some(U64::from(1)),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
            block_number: receipt.block_number.map(|n| n.to::<u64>()),
        }
    }
}

/// Provider-backed client for one archive node
pub struct RpcChainClient {
    provider: RootProvider<Http<Client>>,
    rpc: RpcClient<Http<Client>>,
}

impl RpcChainClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(SettlementError::Configuration(
                "archive node URL is empty".to_string(),
            ));
        }
        let url: reqwest::Url = url.trim().parse().map_err(|e| {
            SettlementError::Configuration(format!("invalid archive node URL '{}': {}", url, e))
        })?;

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Configuration(format!("HTTP client: {}", e)))?;

        let rpc = RpcClient::new(Http::with_client(http, url), false);
        let provider: RootProvider<Http<Client>> = ProviderBuilder::new().on_client(rpc.clone());

        Ok(Self { provider, rpc })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockWithTransactions>> {
        let block: Option<NodeBlock> = self
            .rpc
            .request("eth_getBlockByNumber", (BlockNumberOrTag::Number(number), true))
            .await?;

        Ok(block.map(|block| BlockWithTransactions {
            number: block.number.to::<u64>(),
            transactions: block
                .transactions
                .into_iter()
                .map(|tx| TransactionInfo {
                    hash: tx.hash,
                    gas_price: tx.gas_price,
                })
                .collect(),
        }))
    }

    async fn transaction_receipts(&self, hashes: &[B256]) -> Result<Vec<Option<TransactionReceipt>>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = self.rpc.new_batch();
        let mut waiters = Vec::with_capacity(hashes.len());
        for hash in hashes {
            waiters.push(batch.add_call::<_, Option<NodeReceipt>>("eth_getTransactionReceipt", &(*hash,))?);
        }
        batch.send().await?;

        let mut receipts = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            receipts.push(waiter.await?.map(TransactionReceipt::from));
        }
        debug!(count = receipts.len(), "Fetched receipt batch");
        Ok(receipts)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>> {
        let receipt: Option<NodeReceipt> = self
            .rpc
            .request("eth_getTransactionReceipt", (hash,))
            .await?;
        Ok(receipt.map(TransactionReceipt::from))
    }

    async fn transaction_count(&self, address: Address, block: BlockTag) -> Result<u64> {
        Ok(self
            .provider
            .get_transaction_count(address)
            .block_id(block.into())
            .await?)
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockTag) -> Result<Bytes> {
        let request = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(data));
        Ok(self.provider.call(&request).block(block.into()).await?)
    }

    async fn send_raw_transaction(&self, raw_tx: &str) -> Result<B256> {
        let bytes = hex::decode(raw_tx.trim().trim_start_matches("0x"))
            .map_err(|e| SettlementError::ChainCall(format!("raw transaction is not hex: {}", e)))?;
        let pending = self.provider.send_raw_transaction(&bytes).await?;
        Ok(*pending.tx_hash())
    }
}
