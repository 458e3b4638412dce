pub mod adapter;
pub mod app;
pub mod cli;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod external;
pub mod network;
pub mod provider;
pub mod proxy;
