//! Supervision of the Delcos XL controlled M1M3 air compressors.
//!
//! The compressors are reached over Modbus TCP ([`connection`], [`modbus`]). [`csc`] runs the
//! component state machine on top of [`model`], and [`mqtt`] exchanges its commands, events and
//! telemetry with the rest of the observatory.

pub mod commands;
pub mod connection;
pub mod csc;
pub mod modbus;
pub mod model;
pub mod mqtt;
pub mod registers;
pub mod simulator;
