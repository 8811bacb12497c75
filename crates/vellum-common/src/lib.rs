//! Vellum common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Vellum components.

pub mod config;
pub mod error;
pub mod location;
pub mod serializer;

pub use config::StoreConfig;
pub use error::{Result, VellumError};
pub use location::{BlockId, Location, RecordId, BLOCK_SIZE};
pub use serializer::{
    ByteArraySerializer, Serializer, StringSerializer, U64Serializer, UnitSerializer,
};
