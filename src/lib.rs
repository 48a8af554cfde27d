//! Soil-moisture radio gateway library
//!
//! Decodes sensor frames, keeps the device registry and archives readings to
//! InfluxDB through a local backlog that absorbs sink outages.

pub mod archive;
pub mod backlog;
pub mod config;
pub mod feed;
pub mod frame;
pub mod influxdb;
pub mod mqtt;
pub mod pipeline;
pub mod registry;
