pub mod bili_source;
pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod fetch_client;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod state;
