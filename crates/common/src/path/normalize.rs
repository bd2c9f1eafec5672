// Repository path canonicalization: NFKC normalization, traversal rejection, 256 char max.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed prefix length in characters.
const MAX_PREFIX_CHARS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path prefix exceeds maximum length of {MAX_PREFIX_CHARS} characters")]
    TooLong,

    #[error("path prefix contains directory traversal component: {0}")]
    Traversal(String),

    #[error("path prefix contains null byte")]
    NullByte,

    #[error("path prefix contains invalid component: {0}")]
    InvalidComponent(String),
}

/// Normalize the path prefix a target writes message files under.
///
/// An empty prefix (or one made only of separators) is allowed and means the
/// repository root. Otherwise:
/// - Apply Unicode NFKC normalization
/// - Convert all separators to `/`
/// - Collapse consecutive `/` and strip leading/trailing `/`
/// - Reject `.` and `..` components, null bytes, whitespace-only components
pub fn normalize_prefix(input: &str) -> Result<String, PathError> {
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let normalized: String = input.nfkc().collect();
    let unified = normalized.replace('\\', "/");
    let components: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();

    for component in &components {
        if *component == "." || *component == ".." {
            return Err(PathError::Traversal((*component).to_string()));
        }
        if component.trim().is_empty() {
            return Err(PathError::InvalidComponent("(whitespace-only component)".to_string()));
        }
    }

    let result = components.join("/");
    if result.chars().count() > MAX_PREFIX_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Join an already-normalized prefix with a file name.
pub fn join_repo_path(prefix: &str, file_name: &str) -> String {
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{prefix}/{file_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prefix_is_unchanged() {
        assert_eq!(normalize_prefix("messages").unwrap(), "messages");
    }

    #[test]
    fn separators_are_collapsed_and_trimmed() {
        assert_eq!(normalize_prefix("/chat//messages/").unwrap(), "chat/messages");
        assert_eq!(normalize_prefix("chat\\messages").unwrap(), "chat/messages");
    }

    #[test]
    fn empty_prefix_means_repository_root() {
        assert_eq!(normalize_prefix("").unwrap(), "");
        assert_eq!(normalize_prefix("///").unwrap(), "");
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(normalize_prefix("../etc"), Err(PathError::Traversal("..".to_string())));
        assert_eq!(normalize_prefix("a/./b"), Err(PathError::Traversal(".".to_string())));
    }

    #[test]
    fn rejects_null_byte() {
        assert_eq!(normalize_prefix("msg\0s"), Err(PathError::NullByte));
    }

    #[test]
    fn rejects_whitespace_component() {
        assert!(matches!(normalize_prefix("a/ /b"), Err(PathError::InvalidComponent(_))));
    }

    #[test]
    fn rejects_overlong_prefix() {
        assert_eq!(normalize_prefix(&"a".repeat(257)), Err(PathError::TooLong));
        assert!(normalize_prefix(&"a".repeat(256)).is_ok());
    }

    #[test]
    fn nfkc_folds_compatibility_characters() {
        // Fullwidth letters fold to ASCII.
        assert_eq!(normalize_prefix("ｍｓｇ").unwrap(), "msg");
    }

    #[test]
    fn join_handles_root_prefix() {
        assert_eq!(join_repo_path("", "1.txt"), "1.txt");
        assert_eq!(join_repo_path("messages", "1.txt"), "messages/1.txt");
    }
}
