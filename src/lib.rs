pub mod config;
pub mod crew;
pub mod error;
pub mod shutdown;
pub mod workflow;
pub mod workspace;
