//! Per-user ledger book: activity records, balances, gates and claims.

use crate::protocol::{Facet, Protocol, TokenId};
use crate::types::{amount, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Activity counters for one (user, protocol) pair, or the cross-protocol
/// totals for a user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(with = "amount")]
    pub borrowed_amount: U256,
    #[serde(with = "amount")]
    pub supplied_amount: U256,
    #[serde(with = "amount")]
    pub repaid_amount: U256,
    pub latest_block: u64,
    /// Raw value of the last applied observation.
    #[serde(with = "amount")]
    pub latest_balance: U256,
    pub borrow_times: u64,
    pub supply_times: u64,
    pub repay_times: u64,
    /// 0 until the first accepted observation.
    pub first_activity_block: u64,
    pub liquidations: u64,
}

pub type UserProtocolInfo = ActivityRecord;
pub type Totals = ActivityRecord;

/// Classification of a balance change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Movement {
    Borrow,
    Supply,
    Repay,
    /// Collateral decrease; `supplied_amount` is a ratchet and ignores it.
    Withdraw,
}

impl Movement {
    pub(crate) fn classify(facet: Facet, stored: U256, observed: U256) -> (Movement, U256) {
        if observed >= stored {
            let m = match facet {
                Facet::Debt => Movement::Borrow,
                Facet::Collateral => Movement::Supply,
            };
            (m, observed - stored)
        } else {
            let m = match facet {
                Facet::Debt => Movement::Repay,
                Facet::Collateral => Movement::Withdraw,
            };
            (m, stored - observed)
        }
    }

    /// True if this movement changes an amount/counter pair.
    pub(crate) fn is_counted(self) -> bool {
        !matches!(self, Movement::Withdraw)
    }
}

impl ActivityRecord {
    pub(crate) fn record_movement(&mut self, movement: Movement, usd: U256) {
        match movement {
            Movement::Borrow => {
                self.borrowed_amount = self.borrowed_amount.saturating_add(usd);
                self.borrow_times = self.borrow_times.saturating_add(1);
            }
            Movement::Supply => {
                self.supplied_amount = self.supplied_amount.saturating_add(usd);
                self.supply_times = self.supply_times.saturating_add(1);
            }
            Movement::Repay => {
                self.repaid_amount = self.repaid_amount.saturating_add(usd);
                self.repay_times = self.repay_times.saturating_add(1);
            }
            Movement::Withdraw => {}
        }
    }

    pub(crate) fn touch(&mut self, block: u64, raw_value: U256) {
        self.latest_block = self.latest_block.max(block);
        self.latest_balance = raw_value;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BalanceKey {
    pub protocol: Protocol,
    pub token_id: TokenId,
    pub facet: Facet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct GateKey {
    pub protocol: Protocol,
    pub facet: Facet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ClaimKey {
    pub protocol: Protocol,
    pub token_id: TokenId,
    pub facet: Facet,
    pub block: u64,
}

/// Everything the ledger holds for one user. Published as an immutable
/// snapshot; ingests mutate a private copy.
#[derive(Clone, Debug, Default)]
pub(crate) struct UserBook {
    pub protocols: HashMap<Protocol, ActivityRecord>,
    pub totals: ActivityRecord,
    pub balances: HashMap<BalanceKey, U256>,
    pub gates: HashMap<GateKey, u64>,
    pub claimed: HashSet<ClaimKey>,
}

impl UserBook {
    pub(crate) fn record(&self, protocol: Protocol) -> ActivityRecord {
        self.protocols.get(&protocol).cloned().unwrap_or_default()
    }

    pub(crate) fn gate(&self, protocol: Protocol, facet: Facet) -> u64 {
        self.gates
            .get(&GateKey { protocol, facet })
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn set_liquidations(&mut self, protocol: Protocol, count: u64) {
        self.protocols.entry(protocol).or_default().liquidations = count;
        self.totals.liquidations = self
            .protocols
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.liquidations));
    }
}
