use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// HTTP listen port
/// Read once at startup from the PORT environment variable, default 3200
pub static PORT: Lazy<u16> = Lazy::new(|| {
    env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3200)
});

/// Cached extractor binary path
/// Read from EXTRACTOR_PATH, defaults to "yt-dlp" (resolved via PATH)
pub static EXTRACTOR_BIN: Lazy<String> =
    Lazy::new(|| env::var("EXTRACTOR_PATH").unwrap_or_else(|_| "yt-dlp".to_string()));

/// Cached transcoder binary path
/// Read from TRANSCODER_PATH, defaults to "ffmpeg" (resolved via PATH)
pub static TRANSCODER_BIN: Lazy<String> =
    Lazy::new(|| env::var("TRANSCODER_PATH").unwrap_or_else(|_| "ffmpeg".to_string()));

/// Optional log file path
/// Read from LOG_FILE_PATH environment variable; unset means console-only
pub static LOG_FILE_PATH: Lazy<Option<String>> = Lazy::new(|| {
    env::var("LOG_FILE_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
});

/// Origins permitted to make cross-origin requests, comma-separated.
/// Read from ALLOWED_ORIGINS. Only enforced in production mode; development
/// mode stays permissive so local dev servers (localhost:3000 and friends) work.
pub static ALLOWED_ORIGINS: Lazy<Vec<String>> = Lazy::new(|| {
    env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
});

/// Deployment mode, "development" or "production"
/// Read from MODE environment variable, default development
pub static MODE: Lazy<String> =
    Lazy::new(|| env::var("MODE").unwrap_or_else(|_| "development".to_string()));

/// True when running in production mode
pub fn is_production() -> bool {
    MODE.as_str() == "production"
}

/// Rate limiting configuration
///
/// Each endpoint family gets its own sliding window. The max counts can be
/// overridden per deployment via environment variables; the windows are fixed.
pub mod rate_limit {
    use once_cell::sync::Lazy;
    use std::env;
    use std::time::Duration;

    fn env_max(var: &str, default: usize) -> usize {
        env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Global limit: requests per 15 minutes per client IP
    /// Read from RATE_LIMIT_MAX, default 100
    pub static GLOBAL_MAX: Lazy<usize> = Lazy::new(|| env_max("RATE_LIMIT_MAX", 100));
    pub const GLOBAL_WINDOW: Duration = Duration::from_secs(15 * 60);

    /// Analyze limit: requests per 15 minutes per client IP
    /// Read from ANALYZE_RATE_LIMIT_MAX, default 30
    pub static ANALYZE_MAX: Lazy<usize> = Lazy::new(|| env_max("ANALYZE_RATE_LIMIT_MAX", 30));
    pub const ANALYZE_WINDOW: Duration = Duration::from_secs(15 * 60);

    /// Download limit: requests per hour per client IP
    /// Read from DOWNLOAD_RATE_LIMIT_MAX, default 10
    pub static DOWNLOAD_MAX: Lazy<usize> = Lazy::new(|| env_max("DOWNLOAD_RATE_LIMIT_MAX", 10));
    pub const DOWNLOAD_WINDOW: Duration = Duration::from_secs(60 * 60);

    /// Convert limit: requests per hour per client IP
    /// Read from CONVERT_RATE_LIMIT_MAX, default 5
    pub static CONVERT_MAX: Lazy<usize> = Lazy::new(|| env_max("CONVERT_RATE_LIMIT_MAX", 5));
    pub const CONVERT_WINDOW: Duration = Duration::from_secs(60 * 60);

    /// Queue status limit: requests per minute per client IP
    /// Read from QUEUE_STATUS_RATE_LIMIT_MAX, default 300
    pub static QUEUE_STATUS_MAX: Lazy<usize> =
        Lazy::new(|| env_max("QUEUE_STATUS_RATE_LIMIT_MAX", 300));
    pub const QUEUE_STATUS_WINDOW: Duration = Duration::from_secs(60);
}

/// Timeouts for the external pipeline stages
pub mod timeouts {
    use once_cell::sync::Lazy;
    use std::env;
    use std::time::Duration;

    /// Metadata extraction (--dump-json) timeout
    pub const ANALYZE_SECS: u64 = 30;

    pub fn analyze() -> Duration {
        Duration::from_secs(ANALYZE_SECS)
    }

    /// Streaming download timeout in milliseconds
    /// Read from DOWNLOAD_TIMEOUT_MS, default 10 minutes
    pub static DOWNLOAD_MS: Lazy<u64> = Lazy::new(|| {
        env::var("DOWNLOAD_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10 * 60 * 1000)
    });

    pub fn download() -> Duration {
        Duration::from_millis(*DOWNLOAD_MS)
    }

    /// Conversion pipeline timeout in milliseconds
    /// Read from CONVERSION_TIMEOUT_MS, default 15 minutes
    pub static CONVERSION_MS: Lazy<u64> = Lazy::new(|| {
        env::var("CONVERSION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15 * 60 * 1000)
    });

    pub fn conversion() -> Duration {
        Duration::from_millis(*CONVERSION_MS)
    }

    /// Image proxy fetch timeout
    pub const IMAGE_PROXY_SECS: u64 = 10;

    pub fn image_proxy() -> Duration {
        Duration::from_secs(IMAGE_PROXY_SECS)
    }
}

/// Input validation limits
pub mod validation {
    /// Maximum URL length in octets
    pub const MAX_URL_LENGTH: usize = 2048;

    /// Maximum number of URLs accepted by batch analyze
    pub const MAX_BATCH_URLS: usize = 20;

    /// Hard cap on extractor JSON output (10 MiB)
    pub const ANALYZE_BUFFER_CAP: usize = 10 * 1024 * 1024;

    /// Maximum sanitized filename length for the Content-Disposition header
    pub const MAX_FILENAME_LENGTH: usize = 100;
}

/// Progress bus configuration
pub mod progress {
    use super::Duration;

    /// Heartbeat interval on push streams
    pub const HEARTBEAT_SECS: u64 = 30;

    pub fn heartbeat() -> Duration {
        Duration::from_secs(HEARTBEAT_SECS)
    }

    /// Byte step between progress reports from the counting stream
    pub const REPORT_STEP_BYTES: u64 = 64 * 1024;

    /// How often the session GC runs
    pub const GC_INTERVAL_SECS: u64 = 5 * 60;

    pub fn gc_interval() -> Duration {
        Duration::from_secs(GC_INTERVAL_SECS)
    }

    /// Age after which a terminal session is collected
    pub const SESSION_TTL_SECS: i64 = 30 * 60;

    /// Grace period before a cancelled session is removed from the registry
    pub const CANCEL_REMOVAL_GRACE_SECS: u64 = 5;

    /// Per-session broadcast buffer; slow subscribers fall back to snapshots
    pub const EVENT_BUFFER: usize = 64;
}

/// Scheduler configuration
pub mod queue {
    use super::Duration;

    /// How often the job GC runs
    pub const GC_INTERVAL_SECS: u64 = 5 * 60;

    pub fn gc_interval() -> Duration {
        Duration::from_secs(GC_INTERVAL_SECS)
    }

    /// Age after which a terminal job is collected
    pub const JOB_TTL_SECS: i64 = 30 * 60;
}

/// Subprocess termination configuration
pub mod process {
    use super::Duration;

    /// Window between the graceful signal and the unconditional kill
    pub const GRACEFUL_KILL_WINDOW_SECS: u64 = 2;

    pub fn graceful_kill_window() -> Duration {
        Duration::from_secs(GRACEFUL_KILL_WINDOW_SECS)
    }
}

/// Image proxy configuration
pub mod proxy {
    /// Cacheability window advertised to clients (1 hour)
    pub const CACHE_MAX_AGE_SECS: u64 = 3600;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_windows() {
        assert_eq!(rate_limit::GLOBAL_WINDOW, Duration::from_secs(900));
        assert_eq!(rate_limit::DOWNLOAD_WINDOW, Duration::from_secs(3600));
        assert_eq!(rate_limit::QUEUE_STATUS_WINDOW, Duration::from_secs(60));
    }

    #[test]
    fn test_timeout_defaults() {
        assert_eq!(timeouts::analyze(), Duration::from_secs(30));
        assert_eq!(timeouts::image_proxy(), Duration::from_secs(10));
    }

    #[test]
    fn test_validation_limits() {
        assert_eq!(validation::MAX_URL_LENGTH, 2048);
        assert_eq!(validation::MAX_BATCH_URLS, 20);
        assert_eq!(validation::ANALYZE_BUFFER_CAP, 10 * 1024 * 1024);
    }
}
