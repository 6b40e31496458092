pub mod analyzer;
pub mod confidence;
pub mod config;
pub mod db;
pub mod decision;
pub mod filter;
pub mod git;
pub mod naming;
pub mod orchestrator;
pub mod patch;
pub mod patterns;
pub mod resolver;
pub mod safety;
pub mod scheduler;
pub mod stacktrace;
pub mod tracker;
pub mod types;

pub use types::*;
