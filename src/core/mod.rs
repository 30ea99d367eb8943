//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Trellis:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Cluster bootstrap and shutdown
//! - [`identity`] - Client, connection, server and hold identifiers
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod identity;
pub mod runtime;
