//! Morpho Blue: per-market borrow shares and collateral amounts.

use crate::protocol::observation::{Facet, Observation, ShareBasis, TokenId};
use crate::protocol::registry::Registry;
use crate::protocol::Protocol;
use crate::types::{amount, Address, MarketId, U256};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MorphoRecord {
    /// Morpho deployment the position was read from.
    pub morpho: Address,
    pub market_id: MarketId,
    pub loan_token: Address,
    pub collateral_token: Address,
    #[serde(with = "amount")]
    pub borrow_shares: U256,
    #[serde(with = "amount")]
    pub collateral: U256,
    #[serde(with = "amount")]
    pub total_borrow_assets: U256,
    #[serde(with = "amount")]
    pub total_borrow_shares: U256,
    pub block: u64,
}

/// Each record yields a debt observation (borrow shares) followed by a
/// collateral observation.
pub(super) fn decode(
    user: Address,
    records: Vec<MorphoRecord>,
    registry: &dyn Registry,
) -> Vec<Observation> {
    let deployment = registry.morpho_deployment();
    let mut out = Vec::with_capacity(records.len() * 2);
    for (index, rec) in records.into_iter().enumerate() {
        if deployment != Some(rec.morpho) {
            warn!(index, morpho = %rec.morpho, "morpho: deployment mismatch, record dropped");
            continue;
        }
        let token_id = TokenId::Morpho {
            market_id: rec.market_id,
        };
        out.push(Observation {
            user,
            protocol: Protocol::Morpho,
            token_id,
            facet: Facet::Debt,
            block: rec.block,
            raw_value: rec.borrow_shares,
            underlying_asset: rec.loan_token,
            share_basis: Some(ShareBasis {
                total_assets: rec.total_borrow_assets,
                total_shares: rec.total_borrow_shares,
            }),
        });
        out.push(Observation {
            user,
            protocol: Protocol::Morpho,
            token_id,
            facet: Facet::Collateral,
            block: rec.block,
            raw_value: rec.collateral,
            underlying_asset: rec.collateral_token,
            share_basis: None,
        });
    }
    out
}
