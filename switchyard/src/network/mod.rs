mod dns;

pub use dns::*;
