use crate::error::CoreError;

/// Checks that `id` can be used as a storage key.
///
/// Stream, saga, and dependency ids end up as file names, so they must be
/// non-empty and must not contain path separators, `..`, or NUL bytes.
///
/// # Errors
///
/// Returns [`CoreError::InvalidId`] describing the first violated rule.
pub fn validate_id(kind: &'static str, id: &str) -> Result<(), CoreError> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if id.contains("..") {
        Some("must not contain '..'")
    } else if id.contains('\0') {
        Some("must not contain NUL bytes")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CoreError::InvalidId {
            kind,
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
