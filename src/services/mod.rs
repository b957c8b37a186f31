pub mod ai;
pub mod config;
pub mod ids;
pub mod paths;
pub mod prompts;
pub mod retry;
