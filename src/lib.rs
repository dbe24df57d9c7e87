pub mod aws;
pub mod backoff;
pub mod cmd;
pub mod config;
pub mod constants;
pub mod error;
pub mod fs;
pub mod generate;
pub mod interface;
pub mod link;
pub mod logger;
pub mod reload;
pub mod setup;
