//! Shared path-segment validation every adapter that accepts a wildcard
//! (`{*rest}`) tail applies before building a cache location or mirror URL
//! from it.

use mahoraga_core::PathValidationError;

/// Rejects a wildcard tail containing a `..` segment, an empty segment
/// (`//`), or a leading `/` (axum's `{*rest}` never yields one, but a
/// caller-constructed `rest` elsewhere might). Anything else is passed
/// through unchanged — conda channels, npm packages, and PyPI index paths
/// all contain characters (`@`, `+`, `~`) that are perfectly legal here.
pub fn reject_traversal(rest: &str) -> Result<(), PathValidationError> {
    if rest.starts_with('/') {
        return Err(PathValidationError::new(format!("path must not start with '/': {rest}")));
    }
    if rest.split('/').any(|segment| segment.is_empty() || segment == ".." || segment == ".") {
        return Err(PathValidationError::new(format!("path traversal rejected: {rest}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_paths() {
        assert!(reject_traversal("conda-forge/linux-64/repodata.json").is_ok());
        assert!(reject_traversal("@scope/pkg@1.0.0/dist/pkg.js").is_ok());
    }

    #[test]
    fn rejects_parent_segment() {
        assert!(reject_traversal("linux-64/../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_leading_slash() {
        assert!(reject_traversal("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(reject_traversal("linux-64//repodata.json").is_err());
    }
}
