pub mod agent;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod protocol;
pub mod sandbox;
pub mod terminal;
pub mod tools;
