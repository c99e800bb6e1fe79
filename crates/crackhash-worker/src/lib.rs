#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod http;
pub mod service;
