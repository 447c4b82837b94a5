//! Aave: aToken (reserve) and variable-debt token balances.

use crate::protocol::observation::{Facet, Observation, TokenId};
use crate::protocol::registry::Registry;
use crate::protocol::Protocol;
use crate::types::{amount, Address, U256};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AaveTokenType {
    Reserve,
    VariableDebt,
    StableDebt,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AaveRecord {
    pub token_type: AaveTokenType,
    /// Declared aToken or debt token address.
    pub token: Address,
    pub underlying: Address,
    #[serde(with = "amount")]
    pub balance: U256,
    pub block: u64,
}

pub(super) fn decode(
    user: Address,
    records: Vec<AaveRecord>,
    registry: &dyn Registry,
) -> Vec<Observation> {
    let mut out = Vec::with_capacity(records.len());
    for (index, rec) in records.into_iter().enumerate() {
        let Some(reserve) = registry.aave_reserve(&rec.underlying) else {
            warn!(index, underlying = %rec.underlying, "aave: unknown reserve, record dropped");
            continue;
        };
        let (expected, facet) = match rec.token_type {
            AaveTokenType::Reserve => (reserve.a_token, Facet::Collateral),
            AaveTokenType::VariableDebt => (reserve.variable_debt_token, Facet::Debt),
            AaveTokenType::StableDebt => {
                warn!(index, token = %rec.token, "aave: stable debt unsupported, record dropped");
                continue;
            }
        };
        if rec.token != expected {
            warn!(
                index,
                declared = %rec.token,
                %expected,
                "aave: token does not match pool reserve data, record dropped"
            );
            continue;
        }
        out.push(Observation {
            user,
            protocol: Protocol::Aave,
            token_id: TokenId::Aave {
                token: rec.token,
                underlying: rec.underlying,
            },
            facet,
            block: rec.block,
            raw_value: rec.balance,
            underlying_asset: rec.underlying,
            share_basis: None,
        });
    }
    out
}
