//! Normalized balance observation shared by all protocol decoders.

use crate::protocol::Protocol;
use crate::types::{amount, Address, MarketId, U256};
use primitive_types::U512;
use serde::{Deserialize, Serialize};

/// Debt vs. collateral/reserve side of a lending position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Debt,
    Collateral,
}

impl Facet {
    pub(crate) fn index(self) -> usize {
        match self {
            Facet::Debt => 0,
            Facet::Collateral => 1,
        }
    }
}

/// Protocol-specific identity of the balance being tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenId {
    /// aToken or variable-debt token, paired with its underlying reserve.
    Aave { token: Address, underlying: Address },
    /// Comet market; `collateral` is `None` for the base (debt) side.
    Compound {
        market: Address,
        collateral: Option<Address>,
    },
    Morpho { market_id: MarketId },
}

/// Market-wide borrow totals used to convert borrow shares to assets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareBasis {
    #[serde(with = "amount")]
    pub total_assets: U256,
    #[serde(with = "amount")]
    pub total_shares: U256,
}

impl ShareBasis {
    /// `shares * total_assets / total_shares`, truncated. Zero when the market
    /// has no shares outstanding; `None` if the result exceeds 256 bits.
    pub fn to_assets(&self, shares: U256) -> Option<U256> {
        if self.total_shares.is_zero() {
            return Some(U256::zero());
        }
        let q = shares.full_mul(self.total_assets) / U512::from(self.total_shares);
        U256::try_from(q).ok()
    }
}

/// One reported (user, token, balance-or-shares, block) fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub user: Address,
    pub protocol: Protocol,
    pub token_id: TokenId,
    pub facet: Facet,
    pub block: u64,
    /// Absolute balance, or borrow shares when `share_basis` is set.
    #[serde(with = "amount")]
    pub raw_value: U256,
    pub underlying_asset: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_basis: Option<ShareBasis>,
}
