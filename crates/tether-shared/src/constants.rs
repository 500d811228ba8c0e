/// Application name, also used as the HTTP user agent product token.
pub const APP_NAME: &str = "tether";

/// How long a hash stays "verified uploaded" before the server is asked again.
pub const UPLOAD_VERIFICATION_WINDOW_SECS: i64 = 10 * 60;

/// Byte XORed into every byte of a munged upload body.
pub const MUNGE_KEY: u8 = 42;

/// Chunk size used when streaming upload bodies.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Fixed reconnect delays for the first three attempts, in seconds.
pub const RETRY_FIXED_DELAYS_SECS: [u64; 3] = [3, 5, 10];

/// Jittered reconnect delay range (inclusive min, exclusive max) once the
/// fixed schedule is exhausted, in seconds.
pub const RETRY_JITTER_RANGE_SECS: (u64, u64) = (10, 20);

/// Attempt index at which a lost connection is announced to the user.
pub const RETRY_ANNOUNCE_ATTEMPT: u32 = 3;

/// How long the "connection lost" notification stays up.
pub const CONNECTION_LOST_NOTIFICATION_SECS: u64 = 10;

/// Default number of concurrent downloads.
pub const DEFAULT_PARALLEL_DOWNLOADS: usize = 10;

/// Tokens this close to expiry are renewed before use.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Capacity of the in-process event bus.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Maximum accepted upload size on the reference file host (200 MiB).
pub const MAX_UPLOAD_SIZE: usize = 200 * 1024 * 1024;
