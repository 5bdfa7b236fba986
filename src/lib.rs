pub mod agent;
pub mod aggregator;
pub mod clock;
pub mod config;
pub mod export;
pub mod history;
pub mod identity;
pub mod snapshot;
pub mod yarn;
