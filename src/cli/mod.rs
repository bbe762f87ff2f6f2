//! CLI command implementations

pub mod list;
pub mod scan;
pub mod search;
pub mod show;
pub mod stats;
