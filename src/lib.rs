pub mod app;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod leads;
pub mod prompting;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;
