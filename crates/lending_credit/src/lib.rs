//! lending_credit: activity ledger and credit scoring for lending protocols.
//!
//! Ingests verified balance snapshots from Aave, Compound and Morpho, folds
//! them into per-user, per-protocol activity totals normalized to USD, and
//! scores the totals. Snapshot authenticity is established before ingest.

pub mod chain;
pub mod compute;
pub mod config;
pub mod ledger;
pub mod protocol;
pub mod types;

pub use chain::{PriceError, PriceNormalizer, ReserveRatioNormalizer, StaticReserves};
pub use compute::{score, score_to_tier, CreditScore, ScoringParams, Tier};
pub use config::CreditConfig;
pub use ledger::{ActivityRecord, FacetGates, GateScope, Ledger, LedgerConfig, LedgerError};
pub use protocol::{Facet, Observation, Protocol, Registry, RegistryConfig, TokenId};
pub use types::{Address, MarketId, U256};
