//! Retracing of symbol sources against distribution debuginfo packages.
//!
//! The building blocks are the [`repository`] holding packages, symbols and backtraces, the
//! [`unpack`] and [`tools`] seams to the system, and the [`pool`] running [`task`]s.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod repository;
pub mod resolve;
pub mod symbols;
pub mod task;
pub mod tools;
pub mod types;
pub mod unpack;
pub mod utils;
