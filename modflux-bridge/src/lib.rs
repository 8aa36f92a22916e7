//! Modbus TCP to InfluxDB bridge.
//!
//! Devices are described by reusable register templates. At startup the
//! configuration is expanded into a [`registry::TargetTable`]; the
//! [`scheduler::Scheduler`] then polls every target on its template's cadence,
//! reading each device's register span in one request, decoding the fields
//! and handing tagged samples to the InfluxDB writer.
//!
//! ```text
//! config -> TargetTable -> Scheduler -> Poller -> ModbusConnection
//!                                          \-> decoder -> Sample -> SinkWriter
//! ```

pub mod config;
pub mod decoder;
pub mod health;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod transport;
