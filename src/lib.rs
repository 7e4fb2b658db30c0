pub mod config;
pub mod device;
pub mod events;
pub mod harvest;
pub mod humanize;
pub mod observability;
pub mod registry;
pub mod session;
