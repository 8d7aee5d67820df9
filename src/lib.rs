pub mod bootstrap;
pub mod config;
pub mod manifest;
pub mod models;
pub mod plan;
pub mod ports;
pub mod provision;
pub mod runners;
pub mod validate;
