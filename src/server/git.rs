//! Git smart HTTP routes
//!
//! Public surface of the git service:
//!   - GET  /:project/info/refs?service=git-upload-pack|git-receive-pack
//!   - POST /:project/git-upload-pack
//!   - POST /:project/git-receive-pack
//!
//! Projects are addressed by numeric id (an optional `.git` suffix is
//! tolerated). Every request is served on whichever node it lands on: if
//! this node holds the project's storage the pack subprocess runs here,
//! otherwise both request and response streams are relayed bit-for-bit to
//! the owning node's internal endpoints. The client cannot tell the two
//! apart.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Response, StatusCode};
use futures::TryStreamExt;
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};

use grange_git::{PackProcess, Service};

use crate::project::parse_project_component;
use crate::server::auth::{caller_from_headers, Caller};
use crate::server::error::ApiError;
use crate::server::AppState;
use crate::work::{WorkError, GIT_PRIORITY};

/// Environment variable carrying the authenticated principal into
/// server-side hooks.
pub const PRINCIPAL_ENV: &str = "GRANGE_PRINCIPAL";

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

#[derive(serde::Deserialize)]
pub struct InfoRefsQuery {
    service: String,
}

/// Smart HTTP responses must never be cached: refs move between requests
/// and stale advertisements break negotiation.
fn git_response(content_type: &str, body: Body) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT")
        .header(header::PRAGMA, "no-cache")
        .header(header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate")
        .body(body)
        .unwrap()
}

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Resolve the project path component and check access for the requested
/// service. Fetch falls back to the pull authorization chain when the
/// regular read check denies.
fn authorize(
    state: &AppState,
    caller: &Caller,
    headers: &HeaderMap,
    project: &str,
    service: Service,
) -> Result<u64, ApiError> {
    if !state.ready.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(ApiError::Starting);
    }
    let project_id = parse_project_component(project)
        .filter(|id| state.registry.get(*id).is_some())
        .ok_or_else(|| ApiError::NotFound(format!("project {project} not found")))?;

    if caller.is_system {
        return Ok(project_id);
    }
    let principal = caller.principal.as_deref();
    let allowed = if service.is_upload() {
        state.policy.can_read(principal, project_id)
            || state
                .pull_authorizations
                .iter()
                .any(|p| p.can_pull(headers, project_id))
    } else {
        state.policy.can_write(principal, project_id)
    };
    if !allowed {
        let verb = if service.is_upload() { "read" } else { "write" };
        return Err(ApiError::PermissionDenied(format!(
            "not authorized to {verb} project {project_id}"
        )));
    }
    Ok(project_id)
}

/// GET /:project/info/refs
pub async fn info_refs(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let service = Service::from_name(&query.service)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown service {:?}", query.service)))?;
    let caller = caller_from_headers(&headers, state.directory.credential());
    let project_id = authorize(&state, &caller, &headers, &project, service)?;
    let protocol = git_protocol(&headers);

    let owner = state.directory.active_node_for(project_id, true).await?;
    let body = if state.directory.is_local(&owner) {
        let git_dir = state.registry.git_dir(project_id);
        if !git_dir.is_dir() {
            return Err(ApiError::NotFound(format!(
                "repository of project {project_id} not found"
            )));
        }
        // The advertisement is cheap; it runs inline rather than through
        // the bounded pool so a pool full of long clones cannot stall it.
        // Spawning before the response exists turns a broken git
        // executable into a proper error status.
        let process =
            PackProcess::spawn_advertisement(&state.git_program, &git_dir, service, protocol.as_deref())?;
        let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        tokio::spawn(async move {
            if let Err(e) = process.stream_advertisement(&mut server_side).await {
                tracing::warn!(project_id, "ref advertisement failed: {e}");
            }
        });
        Body::from_stream(ReaderStream::new(client_side))
    } else {
        let mut query = vec![
            ("projectId", project_id.to_string()),
            ("upload", service.is_upload().to_string()),
        ];
        if let Some(protocol) = protocol {
            query.push(("protocol", protocol));
        }
        let response = state
            .proxy
            .get(&owner, "git-advertise-refs", &query)
            .await?;
        Body::from_stream(response.bytes_stream())
    };
    Ok(git_response(service.advertisement_content_type(), body))
}

/// POST /:project/git-upload-pack
pub async fn upload_pack(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    run_service(state, project, headers, body, Service::UploadPack).await
}

/// POST /:project/git-receive-pack
pub async fn receive_pack(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    run_service(state, project, headers, body, Service::ReceivePack).await
}

async fn run_service(
    state: AppState,
    project: String,
    headers: HeaderMap,
    body: Body,
    service: Service,
) -> Result<Response<Body>, ApiError> {
    let caller = caller_from_headers(&headers, state.directory.credential());
    let project_id = authorize(&state, &caller, &headers, &project, service)?;
    let protocol = git_protocol(&headers);

    let owner = state.directory.active_node_for(project_id, true).await?;
    let body = if state.directory.is_local(&owner) {
        let git_dir = state.registry.git_dir(project_id);
        if !git_dir.is_dir() {
            return Err(ApiError::NotFound(format!(
                "repository of project {project_id} not found"
            )));
        }
        let mut envs = HashMap::new();
        if let Some(principal) = &caller.principal {
            envs.insert(PRINCIPAL_ENV.to_string(), principal.clone());
        }
        let mut input = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
        let (client_side, mut server_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        // The pack run goes through the bounded pool, but the response is
        // not built until the job reports the subprocess is up: a launch
        // failure (missing or broken git executable) must surface as an
        // error status, not a truncated 200. Only failures after the first
        // body byte may truncate.
        let (launched_tx, launched_rx) = oneshot::channel();
        let git_program = state.git_program.clone();
        state.work.submit(GIT_PRIORITY, async move {
            let process = match PackProcess::spawn_negotiation(
                &git_program,
                &git_dir,
                service,
                protocol.as_deref(),
                &envs,
            ) {
                Ok(process) => process,
                Err(e) => {
                    let _ = launched_tx.send(Err(e));
                    return;
                }
            };
            let _ = launched_tx.send(Ok(()));
            if let Err(e) = process.stream(&mut input, &mut server_side).await {
                tracing::warn!(project_id, service = service.name(), "pack run failed: {e}");
            }
        });
        match launched_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            // The job was dropped before it could spawn anything
            Err(_) => return Err(WorkError::Abandoned.into()),
        }
        Body::from_stream(ReaderStream::new(client_side))
    } else {
        let mut query = vec![
            ("projectId", project_id.to_string()),
            ("upload", service.is_upload().to_string()),
        ];
        if let Some(principal) = &caller.principal {
            query.push(("principal", principal.clone()));
        }
        if let Some(protocol) = protocol {
            query.push(("protocol", protocol));
        }
        let response = state
            .proxy
            .post_stream(
                &owner,
                "git-pack",
                &query,
                reqwest::Body::wrap_stream(body.into_data_stream()),
            )
            .await?;
        Body::from_stream(response.bytes_stream())
    };
    Ok(git_response(service.result_content_type(), body))
}
