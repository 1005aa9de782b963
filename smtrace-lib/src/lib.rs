#![doc = include_str!("../README.md")]

mod error;

pub mod config;
pub mod framing;
pub mod measurement;
pub mod obis;
pub mod reader;
pub mod report;
pub mod sml;
pub mod supervisor;

pub use error::{Error, Result};
