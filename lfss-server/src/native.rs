use axum::body::{to_bytes, Body};
use axum::extract::{FromRequest, FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use lfss_core::types::{ByteRange, ConflictPolicy, FileReadPermission};
use lfss_core::{lifecycle, LfssError};

use crate::auth::AuthUser;
use crate::query;
use crate::state::AppState;
use crate::webdav_http;

/// Entry point for everything that isn't the admin namespace: the
/// native file surface (`GET/HEAD/PUT/POST/DELETE /<path>`) and, when
/// enabled, the WebDAV method set. A single fallback handler — rather
/// than per-method axum routes — because both surfaces operate on an
/// open-ended `{*path}` and WebDAV's verbs (`PROPFIND`, `MKCOL`, ...)
/// aren't part of axum's standard `MethodFilter` set.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let auth = match AuthUser::from_request_parts(&mut parts, &state).await {
        Ok(a) => a,
        Err(status) => return status.into_response(),
    };
    let caller = auth.0;
    let raw_path = parts.uri.path().trim_start_matches('/');
    let path = percent_encoding::percent_decode_str(raw_path).decode_utf8_lossy().into_owned();

    if state.engine.config.webdav_enabled && webdav_http::is_dav_method(&parts.method) {
        return webdav_http::handle(&state, &caller, &parts, &path).await.into_response();
    }

    match parts.method {
        Method::GET => get_file_or_dir(&state, &caller, &parts.uri, &parts.headers, &path).await,
        Method::HEAD => head_file(&state, &caller, &parts.headers, &path).await,
        Method::PUT => {
            let data = match to_bytes(body, usize::MAX).await {
                Ok(b) => b,
                Err(_) => return StatusCode::BAD_REQUEST.into_response(),
            };
            put_file(&state, &caller, &parts.uri, data, None).await
        }
        Method::POST => {
            let request = Request::from_parts(parts, body);
            post_upload(&state, &caller, request).await
        }
        Method::DELETE => delete_path(&state, &caller, &path).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn get_file_or_dir(
    state: &AppState,
    caller: &lfss_core::types::UserRecord,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    path: &str,
) -> Response {
    if path.is_empty() || path.ends_with('/') {
        return get_directory(state, caller, path).await;
    }
    if query::flag(uri, "thumb") {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "thumbnails not supported").into_response();
    }

    let range = match parse_range(headers) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let engine = state.engine.clone();
    let rec = match lifecycle::read_file(&engine, caller, path, range).await {
        Ok(r) => r,
        Err(e) => return api_error(e),
    };
    let (file, start, end) = rec;
    let (start, end, stream) = match lifecycle::stream_record_range(engine, file.clone(), ByteRange { start, end: Some(end) }).await {
        Ok(v) => v,
        Err(e) => return api_error(e),
    };

    let body_stream = stream.map(|chunk| chunk.map_err(|e: LfssError| std::io::Error::other(e.to_string())));
    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, file.mime_type.clone())
        .header(header::CONTENT_LENGTH, (end - start).to_string())
        .header(header::ACCEPT_RANGES, "bytes");

    let partial = end - start < file.file_size || start > 0;
    if partial {
        response = response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end.saturating_sub(1).max(start), file.file_size));
    } else {
        response = response.status(StatusCode::OK);
    }
    if query::flag(uri, "download") {
        response = response.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", path.rsplit('/').next().unwrap_or(path)),
        );
    }
    response.body(Body::from_stream(body_stream)).unwrap()
}

async fn get_directory(state: &AppState, caller: &lfss_core::types::UserRecord, path: &str) -> Response {
    let dir = if path.is_empty() { String::new() } else { path.to_string() };
    match lfss_core::directory::list_path_contents(&state.engine, caller, &dir).await {
        Ok(contents) => Json(contents).into_response(),
        Err(e) => api_error(e),
    }
}

async fn head_file(
    state: &AppState,
    caller: &lfss_core::types::UserRecord,
    headers: &HeaderMap,
    path: &str,
) -> Response {
    if path.is_empty() || path.ends_with('/') {
        return StatusCode::FORBIDDEN.into_response();
    }
    let range = match parse_range(headers) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match lifecycle::read_file(&state.engine, caller, path, range).await {
        Ok((file, start, end)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, file.mime_type)
            .header(header::CONTENT_LENGTH, (end - start).to_string())
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty())
            .unwrap(),
        Err(e) => api_error(e),
    }
}

async fn put_file(
    state: &AppState,
    caller: &lfss_core::types::UserRecord,
    uri: &axum::http::Uri,
    data: bytes::Bytes,
    mime_override: Option<&str>,
) -> Response {
    let path = percent_encoding::percent_decode_str(uri.path().trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned();

    let permission = match query::param(uri, "permission") {
        Some(v) => match v.parse::<i64>().ok().and_then(FileReadPermission::from_i64) {
            Some(p) => p,
            None => return (StatusCode::BAD_REQUEST, "invalid permission").into_response(),
        },
        None => FileReadPermission::Unset,
    };
    let conflict = match query::param(uri, "conflict") {
        Some(v) => match ConflictPolicy::parse(&v) {
            Some(c) => c,
            None => return (StatusCode::BAD_REQUEST, "invalid conflict policy").into_response(),
        },
        None => ConflictPolicy::Abort,
    };

    let existed_before = match lifecycle::read_file(&state.engine, caller, &path, ByteRange::full()).await {
        Ok(_) => true,
        Err(LfssError::FileNotFound(_)) => false,
        Err(_) => true,
    };
    let overwrite = conflict == ConflictPolicy::Overwrite;

    match lifecycle::save_file(&state.engine, caller, &path, data, permission, mime_override, overwrite).await {
        Ok(rec) => {
            let status = if existed_before { StatusCode::OK } else { StatusCode::CREATED };
            (status, Json(serde_json::json!({ "url": rec.url }))).into_response()
        }
        Err(LfssError::FileExists(_)) if conflict == ConflictPolicy::Skip => {
            (StatusCode::OK, Json(serde_json::json!({ "url": path, "skipped": true }))).into_response()
        }
        Err(e) => api_error(e),
    }
}

async fn post_upload(state: &AppState, caller: &lfss_core::types::UserRecord, request: Request) -> Response {
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false);

    if !is_multipart {
        let data = match to_bytes(request.into_body(), usize::MAX).await {
            Ok(b) => b,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        return put_file(state, caller, &uri, data, None).await;
    }

    let mut multipart = match axum::extract::Multipart::from_request(request, state).await {
        Ok(m) => m,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let field = match multipart.next_field().await {
        Ok(Some(f)) => f,
        _ => return (StatusCode::BAD_REQUEST, "missing file field").into_response(),
    };
    let mime_override = field.content_type().map(|s| s.to_string());
    let data = match field.bytes().await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    put_file(state, caller, &uri, data, mime_override.as_deref()).await
}

async fn delete_path(state: &AppState, caller: &lfss_core::types::UserRecord, path: &str) -> Response {
    let engine = &state.engine;
    if path.ends_with('/') {
        match lifecycle::delete_dir(engine, caller, path).await {
            Ok(removed) => Json(serde_json::json!({ "removed": removed.len() })).into_response(),
            Err(e) => api_error(e),
        }
    } else {
        match lifecycle::delete_file(engine, caller, path).await {
            Ok(Some(_)) => StatusCode::OK.into_response(),
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(e) => api_error(e),
        }
    }
}

fn parse_range(headers: &HeaderMap) -> Result<ByteRange, Response> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(ByteRange::full());
    };
    let value = value.to_str().map_err(|_| (StatusCode::RANGE_NOT_SATISFIABLE).into_response())?;
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE.into_response());
    };
    let (start_str, end_str) = spec.split_once('-').ok_or_else(|| StatusCode::RANGE_NOT_SATISFIABLE.into_response())?;
    let start: u64 = start_str.parse().map_err(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response())?;
    let end = if end_str.is_empty() {
        None
    } else {
        let e: u64 = end_str.parse().map_err(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response())?;
        Some(e + 1)
    };
    Ok(ByteRange { start, end })
}

pub fn api_error(e: LfssError) -> Response {
    crate::error::ApiError(e).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::RANGE, value.parse().unwrap());
        h
    }

    #[test]
    fn parse_range_no_header_is_full() {
        let range = parse_range(&HeaderMap::new()).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.end, None);
    }

    #[test]
    fn parse_range_bounded() {
        let range = parse_range(&headers_with_range("bytes=10-20")).unwrap();
        assert_eq!(range.start, 10);
        assert_eq!(range.end, Some(21));
    }

    #[test]
    fn parse_range_open_ended() {
        let range = parse_range(&headers_with_range("bytes=100-")).unwrap();
        assert_eq!(range.start, 100);
        assert_eq!(range.end, None);
    }

    #[test]
    fn parse_range_malformed_is_not_satisfiable() {
        let resp = parse_range(&headers_with_range("nonsense")).unwrap_err();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }
}
