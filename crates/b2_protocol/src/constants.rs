use std::time::Duration;

/// Entry point for `b2_authorize_account`; all other calls use the API URL
/// returned by authorization.
pub const API_BASE: &str = "https://api.backblazeb2.com";

/// Version prefix for every JSON control call.
pub const API_PATH: &str = "/b2api/v1/";

/// Sentinel accepted by the service in place of a real SHA-1.
pub const SHA1_DO_NOT_VERIFY: &str = "do_not_verify";

/// The service rejects info maps larger than this.
pub const MAX_FILE_INFO_ENTRIES: usize = 10;

/// Info-map key under which the engine stores a caller-supplied mtime.
pub const LAST_MODIFIED_KEY: &str = "src_last_modified_millis";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
