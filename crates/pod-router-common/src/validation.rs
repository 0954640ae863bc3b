//! Routing annotation validators.
//!
//! Character-level checks applied while parsing per-pod routing annotations.
//! Callers drop invalid items and keep processing the rest of the object, so
//! these return plain booleans instead of errors.

use std::sync::LazyLock;

use regex::Regex;

static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$")
        .unwrap()
});

static IPV4_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$")
        .unwrap()
});

// RFC 3986 path segment: pchar, with percent-encoded octets allowed
static PATH_SEGMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9\-._~!$&'()*+,;=:@]|%[0-9A-Fa-f]{2})+$").unwrap()
});

/// Returns whether the value is a valid DNS hostname or an IPv4 address.
pub fn is_valid_host(value: &str) -> bool {
    !value.is_empty() && value.len() <= 253
        && (HOSTNAME_REGEX.is_match(value) || IPV4_REGEX.is_match(value))
}

/// Returns whether the value is a valid TCP port.
pub fn is_valid_port(port: u32) -> bool {
    port > 0 && port < 65536
}

/// Returns whether the value is a single valid path segment.
pub fn is_valid_path_segment(segment: &str) -> bool {
    PATH_SEGMENT_REGEX.is_match(segment)
}

/// Returns whether the value is a valid absolute path.
///
/// `/` alone is accepted; otherwise the path must start with `/`, contain no
/// empty segments, and every segment must pass [`is_valid_path_segment`].
pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }

    match path.strip_prefix('/') {
        Some(rest) => rest.split('/').all(is_valid_path_segment),
        None => false,
    }
}
