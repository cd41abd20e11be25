//! Core engine: the fetch → decide → apply pipeline run once per invocation.

pub mod coordinator;
pub mod decision;
pub mod fetcher;
pub mod ledger;
