use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use lfss_core::types::UserRecord;
use lfss_core::webdav::{self, Depth};
use lfss_core::{directory, lifecycle};

use crate::native::api_error;
use crate::query;
use crate::state::AppState;

/// The WebDAV verbs this adapter maps onto core operations (§4.6).
/// None of these are part of axum's standard `MethodFilter`, so the
/// fallback handler checks membership here before falling through to
/// the native GET/HEAD/PUT/POST/DELETE handling.
pub fn is_dav_method(method: &Method) -> bool {
    matches!(
        method.as_str(),
        "PROPFIND" | "MKCOL" | "MOVE" | "COPY" | "LOCK" | "UNLOCK" | "PROPPATCH"
    )
}

pub async fn handle(state: &AppState, caller: &UserRecord, parts: &Parts, path: &str) -> Response {
    match parts.method.as_str() {
        "PROPFIND" => propfind(state, caller, parts, path).await,
        "MKCOL" => mkcol(state, caller, path).await,
        "MOVE" => move_resource(state, caller, parts, path).await,
        "COPY" => copy_resource(state, caller, parts, path).await,
        "LOCK" => lock(state, caller, parts, path).await,
        "UNLOCK" => unlock(state, caller, parts, path).await,
        "PROPPATCH" => StatusCode::MULTI_STATUS.into_response(),
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn propfind(state: &AppState, caller: &UserRecord, parts: &Parts, path: &str) -> Response {
    let depth = parts
        .headers
        .get("Depth")
        .and_then(|v| v.to_str().ok())
        .map(Depth::parse)
        .unwrap_or(Depth::One);

    if path.is_empty() {
        let roots = match webdav::propfind_roots(&state.engine, caller).await {
            Ok(r) => r,
            Err(e) => return api_error(e),
        };
        return multistatus_response(render_roots_xml(&roots));
    }

    if path.ends_with('/') {
        let contents = match directory::list_path_contents(&state.engine, caller, path).await {
            Ok(c) => c,
            Err(e) => return api_error(e),
        };
        let body = render_dir_xml(path, &contents, depth);
        return multistatus_response(body);
    }

    match lifecycle::read_file(&state.engine, caller, path, lfss_core::types::ByteRange::full()).await {
        Ok((rec, _, _)) => multistatus_response(render_file_xml(&rec)),
        Err(e) => api_error(e),
    }
}

async fn mkcol(state: &AppState, caller: &UserRecord, path: &str) -> Response {
    let dir = if path.ends_with('/') { path.to_string() } else { format!("{path}/") };
    match webdav::mkcol(&state.engine, caller, &dir).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => api_error(e),
    }
}

fn destination_path(parts: &Parts) -> Option<String> {
    let raw = parts.headers.get("Destination")?.to_str().ok()?;
    let path = raw.split("://").last().and_then(|rest| rest.split_once('/')).map(|(_, p)| p).unwrap_or(raw);
    Some(percent_encoding::percent_decode_str(path).decode_utf8_lossy().trim_start_matches('/').to_string())
}

async fn move_resource(state: &AppState, caller: &UserRecord, parts: &Parts, path: &str) -> Response {
    let Some(dst) = destination_path(parts) else {
        return (StatusCode::BAD_REQUEST, "missing Destination header").into_response();
    };
    let result = if path.ends_with('/') {
        lifecycle::move_dir(&state.engine, caller, path, &dst).await.map(|_| ())
    } else {
        lifecycle::move_file(&state.engine, caller, path, &dst).await.map(|_| ())
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(e),
    }
}

async fn copy_resource(state: &AppState, caller: &UserRecord, parts: &Parts, path: &str) -> Response {
    let Some(dst) = destination_path(parts) else {
        return (StatusCode::BAD_REQUEST, "missing Destination header").into_response();
    };
    let result = if path.ends_with('/') {
        lifecycle::copy_dir(&state.engine, caller, path, &dst).await.map(|_| ())
    } else {
        lifecycle::copy_file(&state.engine, caller, path, &dst).await.map(|_| ())
    };
    match result {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => api_error(e),
    }
}

async fn lock(state: &AppState, caller: &UserRecord, parts: &Parts, path: &str) -> Response {
    if caller.is_guest() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let timeout = query::param(&parts.uri, "timeout")
        .and_then(|v| v.strip_prefix("Second-").map(str::to_string))
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
        .unwrap_or(webdav::DEFAULT_LOCK_TIMEOUT);

    match webdav::lock(&state.engine, caller, path, Some(timeout)).await {
        Ok(token) => {
            let mut resp = StatusCode::OK.into_response();
            resp.headers_mut().insert(
                "Lock-Token",
                HeaderValue::from_str(&format!("<opaquelocktoken:{token}>")).unwrap(),
            );
            resp
        }
        Err(e) => api_error(e),
    }
}

async fn unlock(state: &AppState, caller: &UserRecord, parts: &Parts, path: &str) -> Response {
    let Some(token) = parts
        .headers
        .get("Lock-Token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches(|c| c == '<' || c == '>'))
        .and_then(|v| v.strip_prefix("opaquelocktoken:"))
    else {
        return (StatusCode::BAD_REQUEST, "missing Lock-Token header").into_response();
    };
    match webdav::unlock(&state.engine, caller, path, token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(e),
    }
}

fn multistatus_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

fn render_roots_xml(roots: &[String]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">\n");
    for root in roots {
        out.push_str(&format!(
            "  <D:response><D:href>/{root}/</D:href><D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n"
        ));
    }
    out.push_str("</D:multistatus>\n");
    out
}

fn render_dir_xml(dir: &str, contents: &lfss_core::types::PathContents, depth: Depth) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">\n");
    out.push_str(&format!(
        "  <D:response><D:href>/{dir}</D:href><D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n"
    ));
    if depth != Depth::Zero {
        for d in &contents.dirs {
            out.push_str(&format!(
                "  <D:response><D:href>/{}</D:href><D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n",
                d.url
            ));
        }
        for f in &contents.files {
            out.push_str(&render_file_response(f));
        }
    }
    out.push_str("</D:multistatus>\n");
    out
}

fn render_file_xml(rec: &lfss_core::types::FileRecord) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">\n{}</D:multistatus>\n",
        render_file_response(rec)
    )
}

fn render_file_response(rec: &lfss_core::types::FileRecord) -> String {
    format!(
        "  <D:response><D:href>/{}</D:href><D:propstat><D:prop><D:getcontentlength>{}</D:getcontentlength><D:getcontenttype>{}</D:getcontenttype></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n",
        rec.url, rec.file_size, rec.mime_type
    )
}
