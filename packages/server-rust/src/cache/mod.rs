//! Started caches and the registry that owns them.

pub mod config;
pub mod context;
pub mod registry;
pub mod validator;

pub use config::{name_id, CacheConfig, MAX_PARTITIONS};
pub use context::CacheContext;
pub use registry::{CacheRegistry, RegistryServices, RequestFuture, StartedCache, StoreFactory};
pub use validator::{
    CacheExchangeHooks, CacheValidator, MinServerNodes, NoopHooks, TopologyValidator,
};
