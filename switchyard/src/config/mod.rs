#[allow(clippy::module_inception)]
mod config;
mod error;
mod file_path;
mod proxy_group;
mod proxy_provider;
mod rule_provider;
mod state;

pub use config::*;
pub use error::*;
pub use file_path::*;
pub use proxy_group::*;
pub use proxy_provider::*;
pub use rule_provider::*;
pub use state::*;
