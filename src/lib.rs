//! Gateway core for battery management controllers on a half-duplex
//! serial link: framed protocol engine, register cache and telemetry
//! model, in-process event bus, and the MQTT/HTTP republishing layer.

pub mod alerts;
pub mod bus;
pub mod cache;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod poller;
pub mod proto;
pub mod serial;
pub mod status;
pub mod telemetry;
