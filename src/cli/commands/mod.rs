//! CLI command implementations

pub mod build;
pub mod config;
pub mod graph;
pub mod params;

pub use build::execute as build;
pub use config::execute as config;
pub use graph::execute as graph;
pub use params::execute as params;
