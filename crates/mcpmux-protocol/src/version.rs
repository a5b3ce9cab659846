//! Protocol version registry.
//!
//! One ordered list drives both sides of the hub: downstream negotiation
//! echoes the client's version when it is supported, and the upstream
//! handshake walks the list newest-first until a server accepts one.

/// Supported protocol versions, newest first.
pub const PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// The newest supported version.
pub fn latest_version() -> &'static str {
    PROTOCOL_VERSIONS[0]
}

/// Whether `version` is one the hub speaks.
pub fn supports_version(version: &str) -> bool {
    PROTOCOL_VERSIONS.contains(&version)
}

/// Downstream negotiation: echo the requested version when supported,
/// otherwise answer with the newest one the hub speaks.
pub fn negotiate_downstream(requested: &str) -> &'static str {
    PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or_else(latest_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_supported_version() {
        assert_eq!(negotiate_downstream("2024-11-05"), "2024-11-05");
    }

    #[test]
    fn falls_back_to_latest() {
        assert_eq!(negotiate_downstream("1999-01-01"), latest_version());
    }

    #[test]
    fn versions_are_ordered_newest_first() {
        let mut sorted = PROTOCOL_VERSIONS;
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(sorted, PROTOCOL_VERSIONS);
    }
}
