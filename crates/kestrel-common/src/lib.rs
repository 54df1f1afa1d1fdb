//! Common types for KestrelDB.
//!
//! This crate contains the types shared by every layer of the deduplication
//! index: error definitions, record names and payloads, the volume geometry,
//! the index configuration, and the request model.

pub mod config;
pub mod error;
pub mod geometry;
pub mod record;
pub mod request;

pub use config::IndexConfig;
pub use error::{KestrelError, Result};
pub use geometry::Geometry;
pub use record::{RecordData, RecordName, VolumeRecord};
pub use request::{Location, Request, RequestType, Stage, ZoneMessage};
