use axum::http::Uri;

/// Manual query-string lookup used by the fallback handler, which
/// works against a raw `Request` rather than axum's `Query<T>`
/// extractor (that extractor needs route-level type inference the
/// single catch-all handler doesn't have).
pub fn param<'a>(uri: &'a Uri, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    let query = uri.query()?;
    for pair in query.split('&') {
        let mut it = pair.splitn(2, '=');
        let k = it.next()?;
        if k == key {
            let v = it.next().unwrap_or("");
            return Some(percent_encoding::percent_decode_str(v).decode_utf8_lossy());
        }
    }
    None
}

pub fn flag(uri: &Uri, key: &str) -> bool {
    match param(uri, key) {
        Some(v) => matches!(v.as_ref(), "1" | "true" | "yes" | "on" | ""),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn param_finds_key_and_decodes() {
        let u = uri("/a?path=alice%2Fb.txt&flat=1");
        assert_eq!(param(&u, "path").as_deref(), Some("alice/b.txt"));
        assert_eq!(param(&u, "flat").as_deref(), Some("1"));
        assert_eq!(param(&u, "missing"), None);
    }

    #[test]
    fn flag_accepts_common_truthy_spellings() {
        let u = uri("/a?thumb=true&download&flat=0");
        assert!(flag(&u, "thumb"));
        assert!(flag(&u, "download"));
        assert!(!flag(&u, "flat"));
        assert!(!flag(&u, "missing"));
    }
}
