//! Logging initialization
//!
//! Console logging always; a file sink only when LOG_FILE_PATH is set.
//! The level follows the deployment mode: development gets debug output
//! (subprocess stderr, progress parsing), production stays at info.

use anyhow::Result;
use simplelog::*;
use std::fs::File;

use crate::core::config;

/// Initialize the logger.
///
/// # Arguments
/// * `log_file_path` - Optional path for an additional file sink
pub fn init_logger(log_file_path: Option<&str>) -> Result<()> {
    let level = if config::is_production() {
        LevelFilter::Info
    } else {
        LevelFilter::Debug
    };

    let log_config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Some(path) = log_file_path {
        let log_file =
            File::create(path).map_err(|e| anyhow::anyhow!("Cannot open log file {}: {}", path, e))?;
        loggers.push(WriteLogger::new(level, log_config, log_file));
    }

    CombinedLogger::init(loggers).map_err(|e| anyhow::anyhow!("Logger already installed: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_logger_console_only() {
        // The global logger may already be installed by another test; both
        // outcomes just need to not panic.
        let result = init_logger(None);
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_init_logger_with_file_sink() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let result = init_logger(Some(path));
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_init_logger_unwritable_file_errors() {
        let result = init_logger(Some("/nonexistent-dir/mediaduct.log"));
        assert!(result.is_err());
    }
}
