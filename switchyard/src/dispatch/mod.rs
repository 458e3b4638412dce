mod conn_info;
mod dispatching;
pub mod group;
pub mod pool;
mod proxy;
pub mod rule;
pub mod ruleset;

pub use conn_info::*;
pub use dispatching::*;
pub use group::{ProxyGroup, MAX_RESOLVE_DEPTH};
pub use proxy::*;
