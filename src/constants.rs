//! Shared constants for timeouts, intervals and pool geometry.

/// Seconds without a heartbeat before a session is considered dead.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 120;

/// Interval between heartbeat sweeps on the broker loop.
pub const HEARTBEAT_SWEEP_SECS: u64 = 10;

/// Number of connection attempts made by a `wait_tcp` worker.
pub const WAIT_TCP_ATTEMPTS: u32 = 60;

/// Pause between `wait_tcp` connection attempts.
pub const WAIT_TCP_INTERVAL_MS: u64 = 500;

/// Pause between proxy connect retries inside a tunnel.
pub const PROXY_CONNECT_RETRY_MS: u64 = 250;

/// Read buffer size for the tunnel return path.
pub const PROXY_READ_BUF: usize = 8192;

/// A partial layer file written to within this window has a live uploader.
pub const UPLOAD_ACTIVE_WINDOW_SECS: u64 = 10;

/// Maximum number of layers in a single upload offer.
pub const MAX_UPLOAD_OFFER: usize = 256;

/// Seconds before an unvalidated domain claim is shed.
pub const DOMAIN_PENDING_TIMEOUT_SECS: i64 = 21600;

/// Bottom of each subnet's allocatable range, reserved for tunnel endpoints.
pub const SUBNET_RESERVED_LOW: u32 = 256;

/// Width of the allocatable range, short enough to miss the top addresses.
pub const SUBNET_SPAN: u32 = 65277;

/// Default port for the loopback inspection endpoint.
pub const INSPECT_PORT: u16 = 1024;

/// File name of the broker's secret key inside the state directory.
pub const SECRET_KEY_FILE: &str = "secret.key";

/// Directory under the state dir holding cached image layers.
pub const LAYER_CACHE_DIR: &str = "layer_cache";

/// Suffix for partially uploaded layer files.
pub const UPLOADING_SUFFIX: &str = ".uploading";
