//! Swiss Trader: autonomous LLM-driven paper-trading agent.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod data;
pub mod engine;
pub mod llm;
pub mod retry;
pub mod risk;
pub mod storage;
pub mod types;
