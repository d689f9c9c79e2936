use std::sync::LazyLock;

use regex::Regex;

// `\` separates paths on Windows only; elsewhere it is an ordinary name byte.
#[cfg(windows)]
const KEY_PATTERN: &str = r"^[^/\\\x00]+$";
#[cfg(not(windows))]
const KEY_PATTERN: &str = r"^[^/\x00]+$";

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(KEY_PATTERN).unwrap());

/// A key must name exactly one entry directly under the storage root.
pub fn is_valid_key(key: &str) -> bool {
    KEY_RE.is_match(key) && key != "." && key != ".."
}
