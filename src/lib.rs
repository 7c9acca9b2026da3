pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod pool;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod review;
pub mod runner;
pub mod scan;
pub mod store;
pub mod stream;

#[cfg(test)]
pub mod test_helpers;
