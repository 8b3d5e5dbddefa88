//! Hot-path caches: the shared L1 price matrix, tiered price reads, the
//! gas price cache, and the normalized-pair-key LRU.

pub mod gas_price;
pub mod lru_key;
pub mod price_matrix;
pub mod tiered;

pub use gas_price::{GasPreset, GasPriceCache, GasQuote};
pub use lru_key::PairKeyCache;
pub use price_matrix::{PriceMatrix, PriceRead};
pub use tiered::{PriceLevel, RecentPriceStore, TieredPriceCache};
