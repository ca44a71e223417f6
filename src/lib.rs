pub mod cli;
pub mod config;
pub mod plan;
pub mod provider;
pub mod provision;
pub mod readiness;
pub mod topology;
