//! Mediaduct - media extraction and conversion server
//!
//! Server-side pipeline behind a web UI for analyzing and downloading
//! audio/video from third-party hosts. Extraction and transcoding are
//! delegated to external executables; this crate glues them together:
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, validation, process helpers
//! - `extract`: extractor client (metadata analysis + streamed bytes)
//! - `convert`: conversion targets and transcoder invocation profiles
//! - `progress`: per-download sessions and progress event fan-out
//! - `queue`: job scheduler with the single-active-job invariant
//! - `server`: HTTP edge (routes, rate limiting, CORS, image proxy)

pub mod convert;
pub mod core;
pub mod extract;
pub mod progress;
pub mod queue;
pub mod server;

// Re-export commonly used types for convenience
pub use crate::core::{config, AppError, AppResult};
pub use extract::{analyze, FormatDescriptor, FormatKind, MediaInfo};
pub use progress::{DownloadSession, ProgressBus, ProgressEvent, SessionStatus};
pub use queue::{Job, JobKind, JobScheduler, JobStatus, QueueState};
pub use server::{build_router, serve, AppState};
