#![doc = include_str!("../README.md")]

pub mod broker;
pub mod config;
mod error;
pub mod keyspace;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
