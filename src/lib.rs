//! Rule evaluation engine for an LLM application firewall.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
