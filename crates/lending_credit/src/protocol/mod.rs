//! Protocol-specific payload decoders and registry validation.

mod aave;
mod compound;
mod morpho;
pub(crate) mod observation;
pub(crate) mod registry;

pub use aave::{AaveRecord, AaveTokenType};
pub use compound::{CompoundFacet, CompoundRecord};
pub use morpho::MorphoRecord;
pub use observation::{Facet, Observation, ShareBasis, TokenId};
pub use registry::{AaveReserve, CompoundMarket, Registry, RegistryConfig};

use crate::types::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown protocol tag: {0}")]
    UnknownProtocol(String),
    #[error("malformed {protocol} payload: {source}")]
    Payload {
        protocol: Protocol,
        #[source]
        source: serde_json::Error,
    },
}

/// Closed set of supported lending protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Aave,
    Compound,
    Morpho,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Aave, Protocol::Compound, Protocol::Morpho];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Aave => "aave",
            Protocol::Compound => "compound",
            Protocol::Morpho => "morpho",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Protocol::Aave => 0,
            Protocol::Compound => 1,
            Protocol::Morpho => 2,
        }
    }

    /// Decode a payload into observations for `user`. Records that fail
    /// registry validation are dropped; a payload that does not parse fails.
    pub fn decode(
        self,
        user: Address,
        payload: &[u8],
        registry: &dyn Registry,
    ) -> Result<Vec<Observation>, DecodeError> {
        let observations = match self {
            Protocol::Aave => aave::decode(user, parse_records(self, payload)?, registry),
            Protocol::Compound => compound::decode(user, parse_records(self, payload)?, registry),
            Protocol::Morpho => morpho::decode(user, parse_records(self, payload)?, registry),
        };
        Ok(observations)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aave" => Ok(Protocol::Aave),
            "compound" => Ok(Protocol::Compound),
            "morpho" => Ok(Protocol::Morpho),
            _ => Err(DecodeError::UnknownProtocol(s.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<R> {
    records: Vec<R>,
}

fn parse_records<R: DeserializeOwned>(
    protocol: Protocol,
    payload: &[u8],
) -> Result<Vec<R>, DecodeError> {
    serde_json::from_slice::<Envelope<R>>(payload)
        .map(|e| e.records)
        .map_err(|source| DecodeError::Payload { protocol, source })
}
