pub mod commands;
mod config;
pub mod jenkins;

pub use crate::config::Config;
