//! Compound (Comet): base balance is debt, per-asset collateral is supply.

use crate::protocol::observation::{Facet, Observation, TokenId};
use crate::protocol::registry::Registry;
use crate::protocol::Protocol;
use crate::types::{amount, Address, U256};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompoundFacet {
    Base,
    Collateral,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompoundRecord {
    pub market: Address,
    pub facet: CompoundFacet,
    /// Required when `facet` is `collateral`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collateral_asset: Option<Address>,
    #[serde(with = "amount")]
    pub balance: U256,
    pub block: u64,
}

pub(super) fn decode(
    user: Address,
    records: Vec<CompoundRecord>,
    registry: &dyn Registry,
) -> Vec<Observation> {
    let mut out = Vec::with_capacity(records.len());
    for (index, rec) in records.into_iter().enumerate() {
        let Some(market) = registry.compound_market(&rec.market) else {
            warn!(index, market = %rec.market, "compound: unknown market, record dropped");
            continue;
        };
        let (facet, collateral, underlying) = match rec.facet {
            CompoundFacet::Base => (Facet::Debt, None, market.base_token),
            CompoundFacet::Collateral => {
                let Some(asset) = rec.collateral_asset else {
                    warn!(index, "compound: collateral record without asset, dropped");
                    continue;
                };
                if !market.accepts_collateral(&asset) {
                    warn!(index, %asset, "compound: asset not a market collateral, dropped");
                    continue;
                }
                (Facet::Collateral, Some(asset), asset)
            }
        };
        out.push(Observation {
            user,
            protocol: Protocol::Compound,
            token_id: TokenId::Compound {
                market: rec.market,
                collateral,
            },
            facet,
            block: rec.block,
            raw_value: rec.balance,
            underlying_asset: underlying,
            share_basis: None,
        });
    }
    out
}
