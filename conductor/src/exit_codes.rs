//! Stable exit codes for conductor CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Config is missing, unreadable or invalid, or another error occurred.
pub const INVALID: i32 = 1;
/// `conductor init` refused to overwrite an existing config without `--force`.
pub const EXISTS: i32 = 2;
