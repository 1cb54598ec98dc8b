//! Core types and error handling for Malt.
//!
//! This module hosts the shared error taxonomy ([`MaltError`]) and the
//! user-facing error display layer ([`ErrorContext`], [`user_friendly_error`])
//! used by every other module and by the CLI entry point.

pub mod error;

pub use error::{ErrorContext, MaltError, user_friendly_error};
