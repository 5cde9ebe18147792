//! Core utilities: configuration, errors, logging, validation, and
//! subprocess helpers shared by the pipeline components.

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod validation;

pub use error::{AppError, AppResult};
