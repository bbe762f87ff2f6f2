pub mod adapter;
pub mod cli;
pub mod config;
pub mod service;
pub mod store;

pub use config::Config;
pub use service::HistoryService;
pub use store::CanonicalStore;
