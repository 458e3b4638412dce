mod dispatcher;
pub mod error;

pub use dispatcher::*;
