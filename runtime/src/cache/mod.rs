//! Layer content cache.
//!
//! Built layers are shared across builds by cache key; see [`LayerCache`].

pub mod layer_cache;

pub use layer_cache::{CachedLayer, Layer, LayerCache};
