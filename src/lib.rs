#![allow(clippy::result_large_err)]

pub mod app;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod services;
pub mod store;
pub mod telemetry;

pub mod transport;
