pub mod constants;
pub mod dedup;
pub mod engine;
pub mod envelope;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod phase;
pub mod prompts;
pub mod repair;
pub mod scanner;
pub mod server;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
