//! Extractor client: metadata analysis and streamed byte extraction
//!
//! Two modes against the same external binary:
//! - `metadata::analyze` dumps and normalizes JSON metadata
//! - `stream::stream_download` / `stream::convert_media` pipe media bytes
//!   to the HTTP response, optionally through the transcoder

pub mod errors;
pub mod metadata;
pub mod stream;

pub use errors::ExtractionError;
pub use metadata::{analyze, binary_version, FormatDescriptor, FormatKind, MediaInfo};
pub use stream::{convert_media, stream_download, MediaStream};
