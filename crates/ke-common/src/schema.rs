//! Version stamp carried by every persisted `MetricState` and response.

/// Version written into each stored metric state and estimate response.
///
/// A state whose major version differs from this one is refused on restore
/// instead of being fed to the filter. Minor bumps may only add fields that
/// deserialize with defaults.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Whether a stored state stamped with `version` can be restored.
pub fn is_compatible(version: &str) -> bool {
    major(SCHEMA_VERSION) == major(version)
}

fn major(version: &str) -> u32 {
    version
        .split('.')
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_major_compatible() {
        assert!(is_compatible("1.0.0"));
        assert!(is_compatible("1.4.2"));
    }

    #[test]
    fn test_different_major_incompatible() {
        assert!(!is_compatible("0.9.0"));
        assert!(!is_compatible("2.0.0"));
        assert!(!is_compatible("garbage"));
    }
}
