//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Serving the HTTP API
//! - One-off prediction and evaluation
//! - Initialising a parameter file

pub mod commands;
pub mod handlers;

pub use handlers::{handle_evaluate, handle_init, handle_predict, handle_serve, init_logging};
