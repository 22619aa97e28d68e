pub mod config;
pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod process;
pub mod repo;
pub mod state;
pub mod storage;
