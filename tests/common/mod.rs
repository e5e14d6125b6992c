#![allow(dead_code)]

use alloy::primitives::{keccak256, Address, U256};
use axum::{extract::State, routing::post, Json, Router};
use rewards_collector::{
    config::{ExchangeConfig, GatewayConfig},
    jobs::epoch_sync::CycleGuard,
    services::{
        chain_client::{ChainClient, RpcChainClient},
        distribution::DistributionParams,
        epoch_recorder::EpochRecorder,
        epoch_scraper::{EpochScraper, EpochTiming},
        request_signer::{Credentials, RequestSigner},
        settlement_store::SettlementStore,
        staking_registry::StakingRegistry,
    },
    AppState,
};
use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const COIN: u128 = 1_000_000_000_000_000_000;

/// Four-block epochs keep the fee scrape small
pub fn test_timing() -> EpochTiming {
    EpochTiming {
        epoch_length: 4,
        reorg_margin: 1,
        reorg_wait: Duration::ZERO,
    }
}

/// Set up a fresh in-memory database with all migrations applied
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect("sqlite::memory:").await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn validator(i: u64) -> Address {
    Address::with_last_byte(i as u8 + 1)
}

/// Chain state answered by the fake archive node
#[derive(Default)]
pub struct NodeState {
    pub height: u64,
    /// block number -> (gas price, gas used) per transaction
    pub blocks: HashMap<u64, Vec<(u64, u64)>>,
    /// (fee address, raw staked amount, status)
    pub pool: Vec<(Address, U256, u64)>,
    pub latest_nonce: u64,
    pub pending_nonce: u64,
    /// tx hash -> receipt status
    pub receipts: HashMap<String, bool>,
    pub sent: Vec<String>,
    /// Mine every broadcast transaction successfully
    pub mine_sent: bool,
}

impl NodeState {
    /// `count` active validators staking one coin each, one fee-paying block at 20
    pub fn with_validators(count: u64, height: u64) -> Self {
        let mut state = NodeState {
            height,
            ..NodeState::default()
        };
        state.blocks.insert(20, vec![(1_000, 1_000)]);
        state.pool = (0..count).map(|i| (validator(i), U256::from(COIN), 1)).collect();
        state
    }
}

pub type SharedNode = Arc<Mutex<NodeState>>;

fn quantity(value: u64) -> Value {
    json!(format!("0x{:x}", value))
}

fn tx_hash(block: u64, index: usize) -> String {
    format!("0x{:016x}{:048x}", block, index)
}

fn word(value: U256) -> String {
    hex::encode(value.to_be_bytes::<32>())
}

fn eth_call(state: &NodeState, data: &str) -> Value {
    let data = data.trim_start_matches("0x");
    if data.starts_with("b3944d52") {
        return json!(format!("0x{}", word(U256::from(state.pool.len()))));
    }
    if data.starts_with("22fe6c24") {
        let index = usize::from_str_radix(&data[8..], 16).unwrap_or(usize::MAX);
        if let Some((address, staked, status)) = state.pool.get(index) {
            let mut words = vec![U256::ZERO; 12];
            words[0] = U256::from_be_slice(address.as_slice());
            words[6] = *staked;
            words[11] = U256::from(*status);
            let reply: String = words.into_iter().map(word).collect();
            return json!(format!("0x{}", reply));
        }
    }
    Value::Null
}

fn answer(state: &mut NodeState, req: &Value) -> Value {
    let id = req["id"].clone();
    let params = &req["params"];
    let result = match req["method"].as_str().unwrap_or_default() {
        "eth_blockNumber" => quantity(state.height),
        "eth_getBlockByNumber" => {
            let number = u64::from_str_radix(params[0].as_str().unwrap_or("0x0").trim_start_matches("0x"), 16)
                .unwrap_or_default();
            let txs: Vec<Value> = state
                .blocks
                .get(&number)
                .map(|txs| {
                    txs.iter()
                        .enumerate()
                        .map(|(i, (gas_price, _))| json!({ "hash": tx_hash(number, i), "gasPrice": quantity(*gas_price) }))
                        .collect()
                })
                .unwrap_or_default();
            json!({ "number": quantity(number), "transactions": txs })
        }
        "eth_getTransactionReceipt" => {
            let hash = params[0].as_str().unwrap_or_default().to_lowercase();
            let block_receipt = state.blocks.iter().find_map(|(number, txs)| {
                txs.iter()
                    .enumerate()
                    .find(|(i, _)| tx_hash(*number, *i) == hash)
                    .map(|(_, (_, gas_used))| (*number, *gas_used, true))
            });
            let sent_receipt = state.receipts.get(&hash).map(|status| (1u64, 21_000u64, *status));
            match block_receipt.or(sent_receipt) {
                Some((number, gas_used, status)) => json!({
                    "transactionHash": hash,
                    "status": if status { "0x1" } else { "0x0" },
                    "gasUsed": quantity(gas_used),
                    "blockNumber": quantity(number),
                }),
                None => Value::Null,
            }
        }
        "eth_getTransactionCount" => {
            if params[1] == "pending" {
                quantity(state.pending_nonce)
            } else {
                quantity(state.latest_nonce)
            }
        }
        "eth_call" => {
            let call = &params[0];
            let data = call["input"].as_str().or_else(|| call["data"].as_str());
            eth_call(state, data.unwrap_or_default())
        }
        "eth_sendRawTransaction" => {
            let raw = params[0].as_str().unwrap_or_default().to_string();
            let bytes = hex::decode(raw.trim_start_matches("0x")).unwrap_or_default();
            let hash = format!("{:#x}", keccak256(bytes));
            state.sent.push(raw);
            if state.mine_sent {
                state.receipts.insert(hash.clone(), true);
                state.latest_nonce += 1;
                state.pending_nonce += 1;
            }
            json!(hash)
        }
        _ => {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" }
            })
        }
    };

    if result.is_null() && req["method"] == "eth_call" {
        return json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": 3, "message": "execution reverted" }
        });
    }
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

async fn rpc(State(node): State<SharedNode>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = node.lock().unwrap();
    match body {
        Value::Array(reqs) => Json(Value::Array(reqs.iter().map(|r| answer(&mut state, r)).collect())),
        single => Json(answer(&mut state, &single)),
    }
}

/// Start a fake archive node; returns its URL and a handle on its state
pub async fn spawn_node(state: NodeState) -> (String, SharedNode) {
    let node = Arc::new(Mutex::new(state));
    let app = Router::new().route("/", post(rpc)).with_state(node.clone());
    let url = serve(app).await;
    (format!("{}/", url), node)
}

pub fn chain_client(url: &str) -> Arc<dyn ChainClient> {
    Arc::new(RpcChainClient::new(url, Duration::from_secs(5)).unwrap())
}

pub fn registry(client: Arc<dyn ChainClient>) -> StakingRegistry {
    StakingRegistry::new(client, Address::ZERO, test_timing().epoch_length)
}

pub fn recorder(client: Arc<dyn ChainClient>, store: SettlementStore) -> Arc<EpochRecorder> {
    let scraper = Arc::new(EpochScraper::new(client.clone(), test_timing()));
    Arc::new(EpochRecorder::new(
        scraper,
        registry(client),
        store,
        DistributionParams::default(),
    ))
}

pub async fn create_test_app_state(node_url: &str) -> AppState {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let store = SettlementStore::new(db);
    let client = chain_client(node_url);
    let guard: CycleGuard = Arc::new(tokio::sync::Mutex::new(()));

    AppState {
        store: store.clone(),
        registry: registry(client.clone()),
        recorder: recorder(client, store),
        epoch_guard: guard,
    }
}

fn signer(access_key: &str) -> RequestSigner {
    RequestSigner::new(
        Credentials::new(access_key, "secret"),
        "blockchain".to_string(),
        "signer".to_string(),
        Some("signer.blockchain.amazonaws.com".to_string()),
    )
}

/// Request bodies seen by the fake gateway
pub type GatewayLog = Arc<Mutex<Vec<Value>>>;

/// Fake gateway and co-signing exchange. The gateway echoes the transaction
/// skeleton as its "encrypted" payload and the exchange hex-encodes it into
/// the raw transaction, so every nonce/gas pair yields a distinct raw tx.
pub async fn spawn_signing_services() -> (GatewayConfig, ExchangeConfig, GatewayLog) {
    let log: GatewayLog = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();

    let app = Router::new()
        .route(
            "/gateway/sign",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    let data = body["data"].as_str().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(body);
                    Json(json!({
                        "result": true,
                        "data": { "encrypt_data": data, "extra": { "cipher": "aes", "txhash": "" } }
                    }))
                }
            }),
        )
        .route(
            "/exchange/check",
            post(|Json(body): Json<Value>| async move {
                let payload = body["encrypt_data"].as_str().unwrap_or_default();
                Json(json!({ "data": { "raw_tx": format!("0x{}", hex::encode(payload)) }, "ok": true }))
            }),
        );
    let base = serve(app).await;

    let gateway = GatewayConfig {
        url: format!("{}/gateway/sign", base),
        signer: signer("gateway"),
        chain: "ht2".to_string(),
        asset: "ht".to_string(),
        fee_asset: "ht".to_string(),
        platform: "starlabsne3".to_string(),
        decimal: 18,
        request_timeout: Duration::from_secs(5),
    };
    let exchange = ExchangeConfig {
        url: format!("{}/exchange/check", base),
        signer: signer("exchange"),
        request_timeout: Duration::from_secs(5),
    };
    (gateway, exchange, log)
}

/// Transaction skeleton the gateway was asked to sign, unwrapped from its quotes
pub fn skeleton(body: &Value) -> Value {
    let data = body["data"].as_str().unwrap_or_default();
    serde_json::from_str(data.trim_matches('\'')).unwrap()
}
