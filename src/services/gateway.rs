//! Gateway and co-signing exchange clients
//!
//! The gateway holds signing authority for the system account: it receives the
//! transaction skeleton and answers with an encrypted payload. The co-signing
//! exchange turns that payload into a broadcastable raw transaction. Both
//! requests are SigV4 signed in the query string.

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, GatewayConfig};
use crate::error::{Result, SettlementError};
use crate::services::request_signer::RequestSigner;

/// Transaction the gateway is asked to sign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementTransaction {
    pub from: Address,
    pub to: Address,
    pub calldata: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: U256,
}

/// Gateway answer, forwarded as-is to the co-signing exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedTransaction {
    pub encrypt_data: String,
    pub cipher: String,
    pub tx_hash: String,
}

#[derive(Debug, Serialize)]
struct GatewayPayload {
    addrs: Vec<String>,
    data: String,
    chain: String,
    encrypt_params: String,
}

#[derive(Debug, Serialize)]
struct TransactionSkeleton<'a> {
    to_tag: String,
    asset: &'a str,
    decimal: u32,
    platform: &'a str,
    nonce: u64,
    from: String,
    to: String,
    fee_step: String,
    fee_price: String,
    fee_asset: &'a str,
}

#[derive(Debug, Serialize)]
struct EncryptParams {
    tasks: Vec<SignTask>,
    tx_type: &'static str,
}

#[derive(Debug, Serialize)]
struct SignTask {
    task_id: &'static str,
    user_id: &'static str,
    origin_addr: &'static str,
    task_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    result: bool,
    #[serde(default)]
    data: Option<GatewayData>,
}

#[derive(Debug, Deserialize)]
struct GatewayData {
    #[serde(default)]
    encrypt_data: String,
    extra: GatewayExtra,
}

#[derive(Debug, Deserialize)]
struct GatewayExtra {
    #[serde(default)]
    cipher: String,
    #[serde(default)]
    txhash: String,
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    encrypt_data: &'a str,
    cipher: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    #[serde(default)]
    data: Option<ExchangeData>,
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct ExchangeData {
    #[serde(default)]
    raw_tx: String,
}

/// POST a JSON body signed with `signer` and decode the JSON answer
async fn post_signed<B, R>(
    http: &reqwest::Client,
    url: &str,
    signer: &RequestSigner,
    body: &B,
) -> Result<R>
where
    B: Serialize,
    R: DeserializeOwned,
{
    let bytes = serde_json::to_vec(body).map_err(SettlementError::gateway)?;
    let mut request = http
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(bytes)
        .build()
        .map_err(SettlementError::gateway)?;
    signer.sign_query(&mut request, Utc::now())?;

    let response = http.execute(request).await.map_err(SettlementError::gateway)?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SettlementError::Gateway(format!(
            "{} returned {}: {}",
            url, status, text
        )));
    }

    response.json::<R>().await.map_err(SettlementError::gateway)
}

fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SettlementError::Configuration(format!("HTTP client: {}", e)))
}

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(SettlementError::Configuration("gateway URL is empty".to_string()));
        }
        Ok(Self {
            http: http_client(config.request_timeout)?,
            config,
        })
    }

    fn payload(&self, tx: &SettlementTransaction) -> Result<GatewayPayload> {
        let skeleton = TransactionSkeleton {
            to_tag: format!("0x{}", hex::encode(&tx.calldata)),
            asset: &self.config.asset,
            decimal: self.config.decimal,
            platform: &self.config.platform,
            nonce: tx.nonce,
            from: format!("{:#x}", tx.from),
            to: format!("{:#x}", tx.to),
            fee_step: tx.gas_limit.to_string(),
            fee_price: tx.gas_price.to_string(),
            fee_asset: &self.config.fee_asset,
        };
        let params = EncryptParams {
            tasks: vec![SignTask {
                task_id: "0",
                user_id: "",
                origin_addr: "",
                task_type: "",
            }],
            tx_type: "transfer",
        };

        // The gateway expects both sub-objects as single-quoted JSON strings
        let data = serde_json::to_string(&skeleton).map_err(SettlementError::gateway)?;
        let encrypt_params = serde_json::to_string(&params).map_err(SettlementError::gateway)?;

        Ok(GatewayPayload {
            addrs: vec![format!("{:#x}", tx.from)],
            data: format!("'{}'", data),
            chain: self.config.chain.clone(),
            encrypt_params: format!("'{}'", encrypt_params),
        })
    }

    pub async fn sign_transaction(&self, tx: &SettlementTransaction) -> Result<EncryptedTransaction> {
        let payload = self.payload(tx)?;
        debug!(nonce = tx.nonce, gas_price = %tx.gas_price, "Requesting gateway signature");

        let response: GatewayResponse =
            post_signed(&self.http, &self.config.url, &self.config.signer, &payload).await?;

        if !response.result {
            return Err(SettlementError::Gateway("gateway refused to sign".to_string()));
        }
        let data = response
            .data
            .ok_or_else(|| SettlementError::Gateway("gateway reply has no data".to_string()))?;
        if data.encrypt_data.is_empty() {
            return Err(SettlementError::Gateway(
                "gateway reply has empty encrypt_data".to_string(),
            ));
        }

        info!(nonce = tx.nonce, tx_hash = %data.extra.txhash, "Gateway signed settlement transaction");
        Ok(EncryptedTransaction {
            encrypt_data: data.encrypt_data,
            cipher: data.extra.cipher,
            tx_hash: data.extra.txhash,
        })
    }
}

#[derive(Clone)]
pub struct CoSignerClient {
    http: reqwest::Client,
    config: ExchangeConfig,
}

impl CoSignerClient {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(SettlementError::Configuration("exchange URL is empty".to_string()));
        }
        Ok(Self {
            http: http_client(config.request_timeout)?,
            config,
        })
    }

    /// Exchange the gateway's encrypted payload for a raw signed transaction
    pub async fn raw_transaction(&self, encrypted: &EncryptedTransaction) -> Result<String> {
        let request = ExchangeRequest {
            encrypt_data: &encrypted.encrypt_data,
            cipher: &encrypted.cipher,
        };
        let response: ExchangeResponse =
            post_signed(&self.http, &self.config.url, &self.config.signer, &request).await?;

        let raw_tx = response.data.map(|d| d.raw_tx).unwrap_or_default();
        if raw_tx.trim().is_empty() {
            warn!(tx_hash = %encrypted.tx_hash, "Co-signing exchange returned no raw transaction");
            return Err(SettlementError::EmptySignedTransaction);
        }
        if !response.ok {
            return Err(SettlementError::Gateway(
                "co-signing exchange rejected the payload".to_string(),
            ));
        }
        Ok(raw_tx)
    }
}

/// Turns a prepared settlement transaction into a broadcastable raw transaction
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, tx: &SettlementTransaction) -> Result<String>;
}

/// Gateway signature followed by the co-signing exchange
#[derive(Clone)]
pub struct GatewaySigner {
    gateway: GatewayClient,
    exchange: CoSignerClient,
}

impl GatewaySigner {
    pub fn new(gateway: GatewayClient, exchange: CoSignerClient) -> Self {
        Self { gateway, exchange }
    }
}

#[async_trait]
impl TransactionSigner for GatewaySigner {
    async fn sign(&self, tx: &SettlementTransaction) -> Result<String> {
        let encrypted = self.gateway.sign_transaction(tx).await?;
        self.exchange.raw_transaction(&encrypted).await
    }
}
