/// Defaults shared by the configuration layer and the components that fall back
/// to them when a value is absent.

// Masking
pub const DEFAULT_MASK_REPLACEMENT: &str = "********";
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Keys containing any of these are always masked, whatever the rule list says.
pub const SENSITIVE_KEYWORDS: [&str; 7] = ["password", "secret", "token", "key", "credit", "cvv", "ssn"];

// Request ids
pub const DEFAULT_REQUEST_ID_HEADER: &str = "X-Request-Id";

// Metrics endpoint
pub const DEFAULT_METRICS_ENDPOINT: &str = "/metrics";
pub const METRICS_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const METRICS_AUTH_REALM: &str = "Metrics";

/// Duration histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 10] = [0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Label values longer than this are truncated before they reach a series.
pub const MAX_LABEL_VALUE_LEN: usize = 128;

// Redis metric storage
pub const DEFAULT_REDIS_DATABASE: i64 = 1;
pub const DEFAULT_REDIS_PREFIX: &str = "observatory";
pub const DEFAULT_REDIS_TIMEOUT_MS: u64 = 500;

// Push exporter
pub const DEFAULT_PUSH_ENDPOINT: &str = "https://api.sidmonitor.com";
pub const INGEST_PATH: &str = "/api/v1/ingest";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 5;

// Bodies and payloads
pub const DEFAULT_MAX_BODY_SIZE: usize = 64_000;

// Exception classes left out of the exception metric unless configured otherwise
pub const DEFAULT_IGNORED_EXCEPTIONS: [&str; 4] =
    ["AuthenticationError", "AuthorizationError", "NotFoundError", "ValidationError"];

// Log channels
pub const DEFAULT_LOG_CHANNEL: &str = "observatory";

// Start-time tracking for jobs
pub const DEFAULT_TRACKING_TTL_SECS: u64 = 3_600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
