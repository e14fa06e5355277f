use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use lfss_core::types::FileSortKey;
use lfss_core::{directory, lifecycle, metadata, user, LfssError};

use crate::auth::AuthUser;
use crate::dto::*;
use crate::error::ApiResult;
use crate::state::AppState;

/// The admin/API namespace named in §6, mounted at both `/_api` and
/// `/.api` by the caller. A thin JSON wrapper over the core ops —
/// each handler validates nothing itself beyond query/body shape,
/// deferring every permission and quota decision to `lfss-core`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/meta", get(meta))
        .route("/set-perm", post(set_perm))
        .route("/move", post(move_file))
        .route("/copy", post(copy_file))
        .route("/bundle", get(bundle))
        .route("/count-files", get(count_files))
        .route("/list-files", get(list_files))
        .route("/count-dirs", get(count_dirs))
        .route("/list-dirs", get(list_dirs))
        .route("/get-multiple", post(get_multiple))
        .route("/user/whoami", get(whoami))
        .route("/user/storage", get(storage))
        .route("/user/list-peers", get(list_peers))
        .route("/user/query", get(query_users))
        .route("/user/add", post(add_user))
        .route("/user/add-virtual", post(add_virtual_user))
        .route("/user/update", post(update_user))
        .route("/user/delete", post(delete_user))
        .route("/user/set-peer", post(set_peer))
}

async fn meta(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<MetaQuery>) -> ApiResult<Response> {
    let rec = lifecycle::read_file(&state.engine, &caller, &q.path, lfss_core::types::ByteRange::full())
        .await
        .map(|(rec, _, _)| rec)?;
    Ok(Json(FileRecordDto::from(rec)).into_response())
}

async fn set_perm(State(state): State<AppState>, AuthUser(caller): AuthUser, Json(body): Json<SetPermRequest>) -> ApiResult<Response> {
    let permission = lfss_core::types::FileReadPermission::from_i64(body.permission as i64)
        .ok_or_else(|| LfssError::InvalidOptions(format!("bad permission: {}", body.permission)))?;
    let (rec, _, _) = lifecycle::read_file(&state.engine, &caller, &body.path, lfss_core::types::ByteRange::full()).await?;
    let data = lifecycle::read_record_bytes(&state.engine, &rec).await?;
    let updated = lifecycle::save_file(&state.engine, &caller, &body.path, data, permission, Some(&rec.mime_type), true).await?;
    Ok(Json(FileRecordDto::from(updated)).into_response())
}

async fn move_file(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<MoveCopyQuery>) -> ApiResult<Response> {
    if q.src.ends_with('/') {
        let moved = lifecycle::move_dir(&state.engine, &caller, &q.src, &q.dst).await?;
        Ok(Json(serde_json::json!({ "moved": moved.len() })).into_response())
    } else {
        let rec = lifecycle::move_file(&state.engine, &caller, &q.src, &q.dst).await?;
        Ok((StatusCode::CREATED, Json(FileRecordDto::from(rec))).into_response())
    }
}

async fn copy_file(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<MoveCopyQuery>) -> ApiResult<Response> {
    if q.src.ends_with('/') {
        let copied = lifecycle::copy_dir(&state.engine, &caller, &q.src, &q.dst).await?;
        Ok(Json(serde_json::json!({ "copied": copied.len() })).into_response())
    } else {
        let rec = lifecycle::copy_file(&state.engine, &caller, &q.src, &q.dst).await?;
        Ok((StatusCode::CREATED, Json(FileRecordDto::from(rec))).into_response())
    }
}

async fn bundle(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<BundleQuery>) -> ApiResult<Response> {
    let dir_record = directory::get_dir_record(&state.engine, &caller, &q.path).await.ok();
    let small_enough = dir_record.map(|r| r.size < state.engine.blobs().memory_cap()).unwrap_or(true);

    if small_enough {
        let bytes = lifecycle::zip_dir_in_memory(&state.engine, &caller, &q.path).await?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(axum::http::header::CONTENT_TYPE, "application/zip")
            .body(axum::body::Body::from(bytes))
            .unwrap())
    } else {
        let stream = directory::zip_dir_stream(state.engine.clone(), caller, q.path)
            .map(|chunk| chunk.map_err(|e: LfssError| std::io::Error::other(e.to_string())));
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(axum::http::header::CONTENT_TYPE, "application/zip")
            .body(axum::body::Body::from_stream(stream))
            .unwrap())
    }
}

async fn count_files(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<CountFilesQuery>) -> ApiResult<Response> {
    let n = directory::count_files(&state.engine, &caller, &q.path, q.flat).await?;
    Ok(Json(serde_json::json!({ "count": n })).into_response())
}

async fn list_files(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<ListFilesQuery>) -> ApiResult<Response> {
    let order_by = FileSortKey::parse(&q.order_by)
        .ok_or_else(|| LfssError::InvalidOptions(format!("unknown order_by: {}", q.order_by)))?;
    let records = directory::list_files(
        &state.engine,
        &caller,
        directory::ListFilesQuery { dir: &q.path, offset: q.offset, limit: q.limit, order_by, desc: q.desc, flat: q.flat },
    )
    .await?;
    Ok(Json(records.into_iter().map(FileRecordDto::from).collect::<Vec<_>>()).into_response())
}

async fn count_dirs(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<CountFilesQuery>) -> ApiResult<Response> {
    let n = directory::count_dirs(&state.engine, &caller, &q.path).await?;
    Ok(Json(serde_json::json!({ "count": n })).into_response())
}

async fn list_dirs(State(state): State<AppState>, AuthUser(caller): AuthUser, Query(q): Query<ListDirsQuery>) -> ApiResult<Response> {
    let names = directory::list_dirs(&state.engine, &caller, &q.path, q.offset, q.limit, q.desc).await?;
    Ok(Json(names).into_response())
}

async fn get_multiple(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<GetMultipleRequest>,
) -> ApiResult<Response> {
    let records = lifecycle::read_files_bulk(&state.engine, &caller, &body.urls, body.skip_content).await?;
    let mut out = Vec::with_capacity(records.len());
    for rec in records {
        let entry = match rec {
            Some(rec) => {
                let content = if body.skip_content {
                    None
                } else {
                    let bytes = lifecycle::read_record_bytes(&state.engine, &rec).await?;
                    Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes))
                };
                GetMultipleEntry { record: Some(FileRecordDto::from(rec)), content }
            }
            None => GetMultipleEntry { record: None, content: None },
        };
        out.push(entry);
    }
    Ok(Json(out).into_response())
}

async fn whoami(AuthUser(caller): AuthUser) -> ApiResult<Response> {
    Ok(Json(UserRecordDto::from(caller)).into_response())
}

async fn storage(State(state): State<AppState>, AuthUser(caller): AuthUser) -> ApiResult<Response> {
    let (used, quota) = user::storage(&state.engine, &caller).await?;
    Ok(Json(StorageResponse { used, quota }).into_response())
}

async fn list_peers(State(state): State<AppState>, AuthUser(caller): AuthUser) -> ApiResult<Response> {
    let peers = user::list_peers(&state.engine, &caller).await?;
    Ok(Json(
        peers
            .into_iter()
            .map(|p| serde_json::json!({ "username": p.peer_username, "level": p.level }))
            .collect::<Vec<_>>(),
    )
    .into_response())
}

async fn query_users(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Query(q): Query<UserQuery>,
) -> ApiResult<Response> {
    let users = user::query_users(&state.engine, &caller, q.prefix.as_deref()).await?;
    Ok(Json(users.into_iter().map(UserRecordDto::from).collect::<Vec<_>>()).into_response())
}

async fn add_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<AddUserRequest>,
) -> ApiResult<Response> {
    let created = user::create_user(&state.engine, &caller, &body.username, &body.password, body.max_storage, body.permission).await?;
    Ok((StatusCode::CREATED, Json(UserRecordDto::from(created))).into_response())
}

async fn add_virtual_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<AddVirtualUserRequest>,
) -> ApiResult<Response> {
    let ttl = body.ttl_seconds.map(chrono::Duration::seconds);
    let peer_grants = match &body.peers {
        Some(spec) => metadata::users::parse_peer_list(spec).map_err(LfssError::InvalidOptions)?,
        None => Vec::new(),
    };
    let (created, token) = user::create_virtual_user(&state.engine, &caller, body.max_storage, body.permission, ttl).await?;
    for (peer_username, level) in peer_grants {
        user::set_peer(&state.engine, &caller, &created.username, &peer_username, level).await?;
    }
    Ok((
        StatusCode::CREATED,
        Json(AddVirtualUserResponse { user: UserRecordDto::from(created), token }),
    )
        .into_response())
}

async fn update_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<UpdateUserRequest>,
) -> ApiResult<Response> {
    let updated = user::update_user(
        &state.engine,
        &caller,
        &body.username,
        body.password.as_deref(),
        body.max_storage,
        body.permission,
    )
    .await?;
    Ok(Json(UserRecordDto::from(updated)).into_response())
}

async fn delete_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<DeleteUserRequest>,
) -> ApiResult<Response> {
    user::delete_user(&state.engine, &caller, &body.username).await?;
    Ok(StatusCode::OK.into_response())
}

async fn set_peer(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<SetPeerRequest>,
) -> ApiResult<Response> {
    user::set_peer(&state.engine, &caller, &body.src, &body.dst, body.level).await?;
    Ok(StatusCode::OK.into_response())
}
