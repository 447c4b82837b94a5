//! Repository configuration: ledger settings, registry data, price source.
//!
//! Load from: env `LENDING_CREDIT_CONFIG_PATH`, or `./config/lending_credit.json`,
//! or `./lending_credit.json`. When none exists, defaults are used.

use crate::chain::{
    CacheError, CallCache, FetchError, PairReserveSource, PriceNormalizer, ReserveRatioNormalizer,
    RpcClient, RpcConfig, StaticReserves, DEFAULT_PRICE_EXPONENT,
};
use crate::ledger::{Ledger, LedgerConfig};
use crate::protocol::{Registry, RegistryConfig};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "LENDING_CREDIT_CONFIG_PATH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry has no usd_reference asset")]
    MissingUsdReference,
    #[error("rpc: {0}")]
    Fetch(#[from] FetchError),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// Asset → constant-product pair against the USD reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairConfig {
    pub asset: Address,
    pub pair: Address,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditConfig {
    pub ledger: LedgerConfig,
    pub registry: RegistryConfig,
    /// JSON-RPC endpoint for pair reserves. Without it every non-stable
    /// conversion fails with `NoMarket`.
    pub rpc: Option<RpcConfig>,
    pub pairs: Vec<PairConfig>,
    pub price_exponent: Option<u32>,
    /// SQLite cache for immutable call results.
    pub cache_path: Option<PathBuf>,
}

impl CreditConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load config: env `LENDING_CREDIT_CONFIG_PATH`, then
    /// `./config/lending_credit.json`, then `./lending_credit.json`.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let p = Path::new(&path);
            if p.exists() {
                return Self::load_from_path(p);
            }
        }
        for candidate in [
            Path::new("./config/lending_credit.json"),
            Path::new("./lending_credit.json"),
        ] {
            if candidate.exists() {
                return Self::load_from_path(candidate);
            }
        }
        Ok(Self::default())
    }

    /// Build the price normalizer described by `rpc` / `pairs`.
    pub fn price_normalizer(&self) -> Result<Arc<dyn PriceNormalizer>, ConfigError> {
        let usd = self
            .registry
            .usd_reference
            .ok_or(ConfigError::MissingUsdReference)?;
        let exponent = self.price_exponent.unwrap_or(DEFAULT_PRICE_EXPONENT);
        let Some(rpc) = &self.rpc else {
            info!("no rpc configured; using empty reserve table");
            let n = ReserveRatioNormalizer::new(StaticReserves::new(), usd).with_exponent(exponent);
            return Ok(Arc::new(n));
        };
        let cache = self.cache_path.as_ref().map(CallCache::open).transpose()?;
        let client = RpcClient::new(rpc.clone(), cache)?;
        let pairs = self.pairs.iter().map(|p| (p.asset, p.pair)).collect();
        info!(url = %rpc.url, pairs = self.pairs.len(), "pair reserve source configured");
        let n = ReserveRatioNormalizer::new(PairReserveSource::new(client, pairs), usd)
            .with_exponent(exponent);
        Ok(Arc::new(n))
    }

    /// Assemble a ledger owned by `owner`.
    pub fn build_ledger(&self, owner: Address) -> Result<Ledger, ConfigError> {
        let registry: Arc<dyn Registry> = Arc::new(self.registry.clone());
        Ok(Ledger::new(
            self.ledger.clone(),
            registry,
            self.price_normalizer()?,
            owner,
        ))
    }
}
