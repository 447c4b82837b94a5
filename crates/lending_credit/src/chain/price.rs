//! USD normalization from liquidity-pool reserve ratios.

use crate::chain::rpc::FetchError;
use crate::types::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fixed-point exponent applied to the reserve ratio.
pub const DEFAULT_PRICE_EXPONENT: u32 = 18;

#[derive(Error, Debug)]
pub enum PriceError {
    #[error("no market for asset {0}")]
    NoMarket(Address),
    #[error("price lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("price arithmetic overflow for asset {0}")]
    Overflow(Address),
    #[error("rpc: {0}")]
    Rpc(#[from] FetchError),
}

/// Converts a raw token amount into a USD-normalized amount.
#[async_trait]
pub trait PriceNormalizer: Send + Sync {
    async fn price_in_usd(&self, asset: Address, amount: U256) -> Result<U256, PriceError>;
}

#[async_trait]
impl<T: PriceNormalizer + ?Sized> PriceNormalizer for Arc<T> {
    async fn price_in_usd(&self, asset: Address, amount: U256) -> Result<U256, PriceError> {
        (**self).price_in_usd(asset, amount).await
    }
}

/// Reserves of an `asset` / USD-reference pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolReserves {
    pub asset_reserve: U256,
    pub usd_reserve: U256,
}

/// Reserve discovery strategy. `Ok(None)` means no pool is known.
#[async_trait]
pub trait ReserveSource: Send + Sync {
    async fn reserves(&self, asset: Address, usd: Address)
        -> Result<Option<PoolReserves>, PriceError>;
}

/// Fixed reserve table.
#[derive(Clone, Debug, Default)]
pub struct StaticReserves {
    pools: HashMap<Address, PoolReserves>,
}

impl StaticReserves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, asset: Address, asset_reserve: U256, usd_reserve: U256) -> Self {
        self.pools.insert(
            asset,
            PoolReserves {
                asset_reserve,
                usd_reserve,
            },
        );
        self
    }
}

#[async_trait]
impl ReserveSource for StaticReserves {
    async fn reserves(
        &self,
        asset: Address,
        _usd: Address,
    ) -> Result<Option<PoolReserves>, PriceError> {
        Ok(self.pools.get(&asset).copied())
    }
}

/// `price = usd_reserve * 10^exp / asset_reserve`, `usd = amount * price / 10^exp`.
pub struct ReserveRatioNormalizer<S> {
    source: S,
    usd_reference: Address,
    exponent: u32,
}

impl<S: ReserveSource> ReserveRatioNormalizer<S> {
    pub fn new(source: S, usd_reference: Address) -> Self {
        Self {
            source,
            usd_reference,
            exponent: DEFAULT_PRICE_EXPONENT,
        }
    }

    pub fn with_exponent(mut self, exponent: u32) -> Self {
        self.exponent = exponent;
        self
    }
}

#[async_trait]
impl<S: ReserveSource> PriceNormalizer for ReserveRatioNormalizer<S> {
    async fn price_in_usd(&self, asset: Address, amount: U256) -> Result<U256, PriceError> {
        if asset == self.usd_reference {
            return Ok(amount);
        }
        let reserves = self
            .source
            .reserves(asset, self.usd_reference)
            .await?
            .ok_or(PriceError::NoMarket(asset))?;
        if reserves.asset_reserve.is_zero() {
            return Err(PriceError::NoMarket(asset));
        }
        let scale = U256::from(10u64)
            .checked_pow(U256::from(self.exponent))
            .ok_or(PriceError::Overflow(asset))?;
        let price = reserves
            .usd_reserve
            .checked_mul(scale)
            .ok_or(PriceError::Overflow(asset))?
            / reserves.asset_reserve;
        let usd = amount.full_mul(price) / primitive_types::U512::from(scale);
        U256::try_from(usd).map_err(|_| PriceError::Overflow(asset))
    }
}
