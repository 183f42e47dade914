//! Small concurrency primitives shared by the proxy's caches and pools.
//!
//! Every bounded cache in the proxy (certificate cache, fake-server pool,
//! agent pool) needs the same guarantee: concurrent lookups for the same
//! key must not trigger more than one expensive build. [`singleflight`]
//! provides that. [`pool`] provides the free-list shape used by the
//! request-context object pool.

pub mod pool;
pub mod singleflight;

pub use pool::ObjectPool;
pub use singleflight::SingleFlight;
