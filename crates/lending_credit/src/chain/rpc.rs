//! Ethereum JSON-RPC client with rate limiting and retries, plus the
//! constant-product pair reserve source built on it.

use crate::chain::cache::{CacheError, CallCache};
use crate::chain::price::{PoolReserves, PriceError, ReserveSource};
use crate::types::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
const RATE_LIMIT_MS: u64 = 100;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;
const TIMEOUT_SECS: u64 = 15;

/// `token0()`
const SELECTOR_TOKEN0: [u8; 4] = [0x0d, 0xfe, 0x16, 0x81];
/// `getReserves()`
const SELECTOR_GET_RESERVES: [u8; 4] = [0x09, 0x02, 0xf1, 0xac];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub url: String,
    pub rate_limit_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RPC_URL.to_string(),
            rate_limit_ms: RATE_LIMIT_MS,
            max_retries: MAX_RETRIES,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            timeout_secs: TIMEOUT_SECS,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("invalid rpc url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http status {0}: {1}")]
    Http(u16, String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcErrorBody>,
}

pub struct RpcClient {
    config: RpcConfig,
    url: url::Url,
    client: reqwest::Client,
    cache: Option<CallCache>,
    last_request: Mutex<Option<Instant>>,
    request_count: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig, cache: Option<CallCache>) -> Result<Self, FetchError> {
        let url = url::Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            url,
            client,
            cache,
            last_request: Mutex::new(None),
            request_count: AtomicU64::new(0),
        })
    }

    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let need = Duration::from_millis(self.config.rate_limit_ms);
            let elapsed = prev.elapsed();
            if elapsed < need {
                tokio::time::sleep(need - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// `eth_call` against the latest block.
    pub async fn eth_call(&self, to: &Address, calldata: &[u8]) -> Result<Vec<u8>, FetchError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.request_count.load(Ordering::Relaxed) + 1,
            "method": "eth_call",
            "params": [
                { "to": to.to_string(), "data": format!("0x{}", hex::encode(calldata)) },
                "latest"
            ]
        });

        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            self.rate_limit().await;
            match self.post_once(&body).await {
                Ok(bytes) => {
                    self.request_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(bytes);
                }
                // Execution errors (reverts) are returned as-is.
                Err(e @ FetchError::Rpc { .. }) => return Err(e),
                Err(e) => {
                    if attempt < self.config.max_retries {
                        let ms = self.config.retry_backoff_ms * (1 << attempt);
                        warn!(attempt, ms, error = %e, "rpc retry after error");
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Malformed("no attempt made".to_string())))
    }

    async fn post_once(&self, body: &serde_json::Value) -> Result<Vec<u8>, FetchError> {
        let res = self.client.post(self.url.clone()).json(body).send().await?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(FetchError::Http(status.as_u16(), text));
        }
        let parsed: RpcResponse = res.json().await?;
        if let Some(err) = parsed.error {
            return Err(FetchError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = parsed
            .result
            .ok_or_else(|| FetchError::Malformed("missing result".to_string()))?;
        decode_hex_result(&result)
    }

    /// `eth_call` whose result never changes for a given target and calldata.
    pub async fn eth_call_immutable(
        &self,
        to: &Address,
        calldata: &[u8],
    ) -> Result<Vec<u8>, FetchError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(to, calldata)? {
                debug!(%to, "call cache hit");
                return Ok(hit);
            }
        }
        let result = self.eth_call(to, calldata).await?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(to, calldata, &result) {
                warn!(error = %e, "call cache write failed");
            }
        }
        Ok(result)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

fn decode_hex_result(s: &str) -> Result<Vec<u8>, FetchError> {
    let digits = s.trim().trim_start_matches("0x");
    hex::decode(digits).map_err(|e| FetchError::Malformed(format!("result hex: {}", e)))
}

/// 32-byte ABI word at `index`.
fn abi_word(data: &[u8], index: usize) -> Result<&[u8], FetchError> {
    data.get(index * 32..(index + 1) * 32)
        .ok_or_else(|| FetchError::Malformed(format!("abi word {} out of range", index)))
}

fn abi_address(data: &[u8], index: usize) -> Result<Address, FetchError> {
    let word = abi_word(data, index)?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&word[12..]);
    Ok(Address(out))
}

fn abi_uint(data: &[u8], index: usize) -> Result<U256, FetchError> {
    Ok(U256::from_big_endian(abi_word(data, index)?))
}

/// Reads reserves from constant-product pairs (`token0()` / `getReserves()`)
/// between each asset and the USD reference.
pub struct PairReserveSource {
    client: RpcClient,
    pairs: HashMap<Address, Address>,
}

impl PairReserveSource {
    /// `pairs` maps an asset to its pair contract against the USD reference.
    pub fn new(client: RpcClient, pairs: HashMap<Address, Address>) -> Self {
        Self { client, pairs }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }
}

#[async_trait]
impl ReserveSource for PairReserveSource {
    async fn reserves(
        &self,
        asset: Address,
        usd: Address,
    ) -> Result<Option<PoolReserves>, PriceError> {
        let Some(pair) = self.pairs.get(&asset) else {
            return Ok(None);
        };
        let token0 = abi_address(
            &self.client.eth_call_immutable(pair, &SELECTOR_TOKEN0).await?,
            0,
        )?;
        let raw = self.client.eth_call(pair, &SELECTOR_GET_RESERVES).await?;
        let (r0, r1) = (abi_uint(&raw, 0)?, abi_uint(&raw, 1)?);
        let reserves = if token0 == asset {
            PoolReserves {
                asset_reserve: r0,
                usd_reserve: r1,
            }
        } else if token0 == usd {
            PoolReserves {
                asset_reserve: r1,
                usd_reserve: r0,
            }
        } else {
            warn!(%pair, %token0, %asset, "pair tokens do not match asset/usd");
            return Ok(None);
        };
        debug!(
            %asset,
            %pair,
            asset_reserve = %reserves.asset_reserve,
            usd_reserve = %reserves.usd_reserve,
            "pair reserves"
        );
        Ok(Some(reserves))
    }
}
