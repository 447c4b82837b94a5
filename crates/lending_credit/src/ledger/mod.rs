//! Stateful activity ledger: per-user, per-protocol records, cross-protocol
//! totals, facet gates and claimed observations.
//!
//! Users are partitioned; each user has its own writer lock and an immutable
//! published snapshot. An ingest applies its observations to a private copy
//! of the snapshot and publishes it only if every observation succeeded, so
//! readers see either the full pre-ingest or the full post-ingest state.

mod ingest;
mod state;

pub use state::{ActivityRecord, Totals, UserProtocolInfo};

use crate::chain::{PriceError, PriceNormalizer};
use crate::compute::{score, CreditScore, ScoringParams};
use crate::protocol::{DecodeError, Facet, Protocol, Registry, TokenId};
use crate::types::Address;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use state::{ClaimKey, UserBook};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("caller {0} is not the trusted ingest caller")]
    Unauthorized(Address),
    #[error("caller {0} is not the owner")]
    NotOwner(Address),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("price normalization failed: {0}")]
    Price(#[from] PriceError),
    #[error("share conversion overflow for {0:?}")]
    ShareOverflow(TokenId),
}

/// Scope of the facet gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateScope {
    /// Gate keyed by user × protocol × facet. Different users never contend.
    #[default]
    PerUser,
    /// Gate keyed by protocol × facet, shared by all users. Ingests for the
    /// same protocol serialize.
    Global,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub gate_scope: GateScope,
    /// Deadline for a single price normalizer call; unbounded when unset.
    pub price_timeout_ms: Option<u64>,
    pub scoring: ScoringParams,
}

impl LedgerConfig {
    fn price_timeout(&self) -> Option<Duration> {
        self.price_timeout_ms.map(Duration::from_millis)
    }
}

/// Last accepted block per facet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetGates {
    pub debt: u64,
    pub collateral: u64,
}

#[derive(Debug)]
struct AdminState {
    owner: Address,
    trusted_caller: Address,
}

#[derive(Default)]
struct UserSlot {
    writer: tokio::sync::Mutex<()>,
    book: RwLock<Arc<UserBook>>,
}

impl UserSlot {
    fn snapshot(&self) -> Arc<UserBook> {
        self.book.read().clone()
    }

    fn publish(&self, book: UserBook) {
        *self.book.write() = Arc::new(book);
    }
}

pub struct Ledger {
    config: LedgerConfig,
    registry: Arc<dyn Registry>,
    normalizer: RwLock<Arc<dyn PriceNormalizer>>,
    admin: RwLock<AdminState>,
    users: DashMap<Address, Arc<UserSlot>>,
    /// Highest accepted block per (protocol, facet) across all users; the
    /// gate itself under `GateScope::Global`.
    high_water: [[AtomicU64; 2]; 3],
    protocol_locks: [tokio::sync::Mutex<()>; 3],
}

impl Ledger {
    /// The trusted caller starts out as `owner`.
    pub fn new(
        config: LedgerConfig,
        registry: Arc<dyn Registry>,
        normalizer: Arc<dyn PriceNormalizer>,
        owner: Address,
    ) -> Self {
        Self {
            config,
            registry,
            normalizer: RwLock::new(normalizer),
            admin: RwLock::new(AdminState {
                owner,
                trusted_caller: owner,
            }),
            users: DashMap::new(),
            high_water: Default::default(),
            protocol_locks: Default::default(),
        }
    }

    fn slot(&self, user: Address) -> Arc<UserSlot> {
        self.users.entry(user).or_default().value().clone()
    }

    fn book(&self, user: &Address) -> Option<Arc<UserBook>> {
        self.users.get(user).map(|slot| slot.snapshot())
    }

    fn authorize(&self, caller: &Address) -> Result<(), LedgerError> {
        if self.admin.read().trusted_caller != *caller {
            return Err(LedgerError::Unauthorized(*caller));
        }
        Ok(())
    }

    fn require_owner(&self, caller: &Address) -> Result<(), LedgerError> {
        if self.admin.read().owner != *caller {
            return Err(LedgerError::NotOwner(*caller));
        }
        Ok(())
    }

    /// Externally reported liquidation count for (user, protocol). Totals
    /// carry the sum across protocols.
    pub async fn set_liquidations(
        &self,
        caller: &Address,
        user: Address,
        protocol: Protocol,
        count: u64,
    ) -> Result<(), LedgerError> {
        self.authorize(caller)?;
        let slot = self.slot(user);
        let _writer = slot.writer.lock().await;
        let mut book = (*slot.snapshot()).clone();
        book.set_liquidations(protocol, count);
        slot.publish(book);
        info!(%user, %protocol, count, "liquidations set");
        Ok(())
    }

    // ---- queries ----

    pub fn user_info(&self, user: &Address, protocol: Protocol) -> UserProtocolInfo {
        self.book(user)
            .map(|b| b.record(protocol))
            .unwrap_or_default()
    }

    pub fn totals(&self, user: &Address) -> Totals {
        self.book(user).map(|b| b.totals.clone()).unwrap_or_default()
    }

    /// Protocol-wide gates (highest accepted block over all users).
    pub fn facet_gates(&self, protocol: Protocol) -> FacetGates {
        let row = &self.high_water[protocol.index()];
        FacetGates {
            debt: row[Facet::Debt.index()].load(Ordering::Acquire),
            collateral: row[Facet::Collateral.index()].load(Ordering::Acquire),
        }
    }

    /// Gates as they apply to `user`'s own ingests.
    pub fn user_facet_gates(&self, user: &Address, protocol: Protocol) -> FacetGates {
        match self.config.gate_scope {
            GateScope::Global => self.facet_gates(protocol),
            GateScope::PerUser => self
                .book(user)
                .map(|b| FacetGates {
                    debt: b.gate(protocol, Facet::Debt),
                    collateral: b.gate(protocol, Facet::Collateral),
                })
                .unwrap_or_default(),
        }
    }

    /// True if an observation of `token_id` on `facet` at `block` was applied.
    pub fn is_claimed(
        &self,
        user: &Address,
        protocol: Protocol,
        token_id: TokenId,
        facet: Facet,
        block: u64,
    ) -> bool {
        self.book(user).is_some_and(|b| {
            b.claimed.contains(&ClaimKey {
                protocol,
                token_id,
                facet,
                block,
            })
        })
    }

    pub fn score(&self, user: &Address, current_block: u64) -> CreditScore {
        score(&self.totals(user), current_block, &self.config.scoring)
    }

    pub fn score_per_protocol(
        &self,
        user: &Address,
        protocol: Protocol,
        current_block: u64,
    ) -> CreditScore {
        score(
            &self.user_info(user, protocol),
            current_block,
            &self.config.scoring,
        )
    }

    // ---- administration ----

    pub fn owner(&self) -> Address {
        self.admin.read().owner
    }

    pub fn trusted_caller(&self) -> Address {
        self.admin.read().trusted_caller
    }

    pub fn set_price_normalizer(
        &self,
        caller: &Address,
        normalizer: Arc<dyn PriceNormalizer>,
    ) -> Result<(), LedgerError> {
        self.require_owner(caller)?;
        *self.normalizer.write() = normalizer;
        info!("price normalizer replaced");
        Ok(())
    }

    pub fn set_trusted_caller(&self, caller: &Address, trusted: Address) -> Result<(), LedgerError> {
        self.require_owner(caller)?;
        self.admin.write().trusted_caller = trusted;
        info!(%trusted, "trusted caller set");
        Ok(())
    }

    pub fn transfer_ownership(&self, caller: &Address, new_owner: Address) -> Result<(), LedgerError> {
        self.require_owner(caller)?;
        self.admin.write().owner = new_owner;
        info!(%new_owner, "ownership transferred");
        Ok(())
    }
}
