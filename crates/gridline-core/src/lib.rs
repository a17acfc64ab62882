//! Gridline Core
//!
//! Core domain types, traits, and error handling for Gridline.
//! This crate defines the shared vocabulary (axes, backends, combinations,
//! jobs, gate results, builds) used across all other crates.

pub mod axis;
pub mod build;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod job;
pub mod ports;
pub mod report;
pub mod resolution;
pub mod selection;

pub use error::{Error, ErrorKind, Result};
pub use ids::*;
