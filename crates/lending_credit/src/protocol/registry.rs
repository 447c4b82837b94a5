//! Canonical per-chain token and market addresses consumed by the decoders.
//!
//! The registry is an external collaborator; [`RegistryConfig`] is the static
//! implementation loaded from the `registry` section of the JSON config.

use crate::types::Address;
use serde::{Deserialize, Serialize};

/// Aave reserve token set for one underlying asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaveReserve {
    pub underlying: Address,
    pub a_token: Address,
    pub variable_debt_token: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_debt_token: Option<Address>,
}

/// Compound (Comet) market: base token plus accepted collateral assets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundMarket {
    pub market: Address,
    pub base_token: Address,
    /// Empty list accepts any collateral asset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collaterals: Vec<Address>,
}

impl CompoundMarket {
    pub fn accepts_collateral(&self, asset: &Address) -> bool {
        self.collaterals.is_empty() || self.collaterals.contains(asset)
    }
}

pub trait Registry: Send + Sync {
    /// Reserve tokens the pool reports for `underlying`.
    fn aave_reserve(&self, underlying: &Address) -> Option<AaveReserve>;

    fn compound_market(&self, market: &Address) -> Option<CompoundMarket>;

    fn morpho_deployment(&self) -> Option<Address>;

    /// True if `asset` is a designated USD-stable asset (no price conversion).
    fn is_usd_stable(&self, asset: &Address) -> bool;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub chain_id: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aave_reserves: Vec<AaveReserve>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compound_markets: Vec<CompoundMarket>,

    #[serde(default)]
    pub morpho: Option<Address>,

    /// e.g. USDC, USDT, DAI.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usd_stable_assets: Vec<Address>,

    /// Reference asset the price normalizer quotes against.
    #[serde(default)]
    pub usd_reference: Option<Address>,
}

impl Registry for RegistryConfig {
    fn aave_reserve(&self, underlying: &Address) -> Option<AaveReserve> {
        self.aave_reserves
            .iter()
            .find(|r| &r.underlying == underlying)
            .cloned()
    }

    fn compound_market(&self, market: &Address) -> Option<CompoundMarket> {
        self.compound_markets
            .iter()
            .find(|m| &m.market == market)
            .cloned()
    }

    fn morpho_deployment(&self) -> Option<Address> {
        self.morpho
    }

    fn is_usd_stable(&self, asset: &Address) -> bool {
        self.usd_stable_assets.contains(asset)
    }
}
