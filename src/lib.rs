//! Blind face restoration with an offline ONNX to engine conversion pipeline

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod service;
pub mod utils;

pub use config::Config;
