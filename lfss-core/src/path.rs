use crate::error::LfssError;
use crate::types::{DirConfig, WEBDAV_KEEP_FILE};

/// Validate a file URL against the invariants in the data model: no
/// leading/trailing slash, no segment starting with `_` or `.`, no
/// segment containing `'"\*`, no empty segments, and a non-empty
/// first segment (the owning username). The two system-reserved
/// marker filenames (directory config, WebDAV `MKCOL` placeholder)
/// are exempt from the dotfile rule — they're written internally,
/// never by a caller-supplied path.
pub fn validate_file_url(url: &str) -> Result<(), LfssError> {
    if url.is_empty() || url.ends_with('/') || url.starts_with('/') {
        return Err(LfssError::InvalidPath(url.to_string()));
    }
    if url.ends_with(DirConfig::FILE_NAME) || url.ends_with(WEBDAV_KEEP_FILE) {
        return validate_common_allow_dotfile(url);
    }
    validate_common(url)
}

/// Same as [`validate_file_url`] but permits (in fact requires) a
/// trailing slash, for directory paths.
pub fn validate_dir_url(url: &str) -> Result<(), LfssError> {
    if !url.ends_with('/') || url.starts_with('/') {
        return Err(LfssError::InvalidPath(url.to_string()));
    }
    if url == "/" {
        return Err(LfssError::InvalidPath(url.to_string()));
    }
    validate_common(url.trim_end_matches('/'))
}

fn validate_common(url: &str) -> Result<(), LfssError> {
    validate_segments(url, false)
}

fn validate_common_allow_dotfile(url: &str) -> Result<(), LfssError> {
    validate_segments(url, true)
}

fn validate_segments(url: &str, last_segment_may_be_dotfile: bool) -> Result<(), LfssError> {
    const FORBIDDEN: &[char] = &['\'', '"', '\\', '*'];
    let segments: Vec<&str> = url.split('/').collect();
    let last = segments.len().saturating_sub(1);
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            return Err(LfssError::InvalidPath(url.to_string()));
        }
        let is_reserved_last = last_segment_may_be_dotfile && i == last;
        if !is_reserved_last && (seg.starts_with('_') || seg.starts_with('.')) {
            return Err(LfssError::InvalidPath(url.to_string()));
        }
        if seg.chars().any(|c| FORBIDDEN.contains(&c)) {
            return Err(LfssError::InvalidPath(url.to_string()));
        }
        if !is_reserved_last && seg.chars().all(|c| c == '.') {
            return Err(LfssError::InvalidPath(url.to_string()));
        }
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), LfssError> {
    if username.is_empty() || username.len() > 255 {
        return Err(LfssError::InvalidInput(format!("bad username: {username}")));
    }
    if username.starts_with('/') || username.starts_with('_') {
        return Err(LfssError::InvalidInput(format!("bad username: {username}")));
    }
    // virtual users are explicitly allowed to start with `.v-`.
    if username.starts_with('.') && !username.starts_with(".v-") {
        return Err(LfssError::InvalidInput(format!("bad username: {username}")));
    }
    Ok(())
}

pub fn first_segment(url: &str) -> &str {
    url.split('/').next().unwrap_or(url)
}

/// Escape `%` and `_` for a SQL `LIKE` prefix scan.
pub fn escape_like_prefix(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_leading_trailing_slash() {
        assert!(validate_file_url("/alice/a.txt").is_err());
        assert!(validate_file_url("alice/a.txt/").is_err());
    }

    #[test]
    fn rejects_dotfile_and_underscore_segments() {
        assert!(validate_file_url("alice/.git/config").is_err());
        assert!(validate_file_url("alice/_private/x").is_err());
    }

    #[test]
    fn rejects_forbidden_characters() {
        assert!(validate_file_url("alice/a*b.txt").is_err());
        assert!(validate_file_url("alice/a\"b.txt").is_err());
    }

    #[test]
    fn accepts_plain_path() {
        assert!(validate_file_url("alice/docs/report.pdf").is_ok());
    }

    #[test]
    fn escapes_like_specials() {
        assert_eq!(escape_like_prefix("a_b%c"), "a\\_b\\%c");
    }
}
