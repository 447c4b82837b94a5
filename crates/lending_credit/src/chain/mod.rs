//! Price normalization, JSON-RPC reserve discovery, and call caching.

mod cache;
pub(crate) mod price;
pub(crate) mod rpc;

pub use cache::{CacheError, CallCache};
pub use price::{
    PoolReserves, PriceError, PriceNormalizer, ReserveRatioNormalizer, ReserveSource,
    StaticReserves, DEFAULT_PRICE_EXPONENT,
};
pub use rpc::{FetchError, PairReserveSource, RpcClient, RpcConfig};
