pub mod anthropic;
pub mod cli;
pub mod collab;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod state_machine;
pub mod suggester;
pub mod ui;
