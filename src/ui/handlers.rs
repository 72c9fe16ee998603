//! HTTP API handlers

use axum::{
    extract::{ConnectInfo, Path, Query, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Basic, Authorization},
    TypedHeader,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::SessionId;
use crate::protocol::{SessionInfo, SourceInfo, StreamMetadata};
use crate::ui::server::AppState;

/// User name expected in basic auth credentials
pub const ADMIN_USER: &str = "admin";

type BasicAuth = Option<TypedHeader<Authorization<Basic>>>;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn failure<T>(status: StatusCode, msg: impl Into<String>) -> ApiResult<T> {
    (status, Json(ApiResponse::error(msg)))
}

fn unavailable<T>() -> ApiResult<T> {
    failure(StatusCode::SERVICE_UNAVAILABLE, "stream is shutting down")
}

async fn is_admin(state: &AppState, ip: IpAddr, auth: BasicAuth) -> bool {
    let Some(TypedHeader(Authorization(credentials))) = auth else {
        return false;
    };
    if credentials.username() != ADMIN_USER {
        return false;
    }
    let allowed = state
        .hooks
        .authenticate(Some(ip), credentials.password().to_string(), true)
        .await;
    if !allowed {
        warn!("Admin authentication failed for {}", ip);
    }
    allowed
}

/// The active source as reported by the status endpoint
#[derive(Debug, Serialize)]
pub struct SourceStatus {
    #[serde(flatten)]
    pub info: SourceInfo,
    pub age_secs: i64,
}

/// Server status
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub metadata: StreamMetadata,
    pub source: Option<SourceStatus>,
    pub listeners: Vec<SessionInfo>,
}

/// Get server status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth: BasicAuth,
) -> ApiResult<StatusReport> {
    if !is_admin(&state, addr.ip(), auth).await {
        return failure(StatusCode::UNAUTHORIZED, "authentication required");
    }

    let (Ok(source), Ok(listeners)) = (state.stream.current_source().await, state.stream.list_sessions().await)
    else {
        return unavailable();
    };
    let report = StatusReport {
        metadata: state.stream.metadata(),
        source: source.map(|info| SourceStatus {
            age_secs: info.age_secs(),
            info,
        }),
        listeners,
    };
    (StatusCode::OK, Json(ApiResponse::ok(report)))
}

#[derive(Deserialize)]
pub struct SongRequest {
    pub title: String,
}

/// Set the song title
pub async fn update_song(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth: BasicAuth,
    Json(req): Json<SongRequest>,
) -> ApiResult<String> {
    if !is_admin(&state, addr.ip(), auth).await {
        return failure(StatusCode::UNAUTHORIZED, "authentication required");
    }
    match state.stream.update_song_title(req.title).await {
        Ok(applied) => (StatusCode::OK, Json(ApiResponse::ok(applied))),
        Err(_) => unavailable(),
    }
}

/// Disconnect the current source
pub async fn kick_source(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth: BasicAuth,
) -> ApiResult<bool> {
    if !is_admin(&state, addr.ip(), auth).await {
        return failure(StatusCode::UNAUTHORIZED, "authentication required");
    }
    match state.stream.kick_source().await {
        Ok(kicked) => {
            info!("Kicked source (admin request from {})", addr.ip());
            (StatusCode::OK, Json(ApiResponse::ok(kicked)))
        }
        Err(_) => unavailable(),
    }
}

/// Disconnect one listener
pub async fn kick_listener(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth: BasicAuth,
    Path(id): Path<String>,
) -> ApiResult<()> {
    if !is_admin(&state, addr.ip(), auth).await {
        return failure(StatusCode::UNAUTHORIZED, "authentication required");
    }
    let Ok(id) = id.parse::<SessionId>() else {
        return failure(StatusCode::BAD_REQUEST, format!("invalid listener id {}", id));
    };
    match state.stream.kick_listener(id).await {
        Ok(true) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Ok(false) => failure(StatusCode::NOT_FOUND, format!("no listener {}", id)),
        Err(_) => unavailable(),
    }
}

/// Query of the SHOUTcast-compatible admin endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ShoutcastQuery {
    pub mode: Option<String>,
    pub pass: Option<String>,
    pub song: Option<String>,
    pub dst: Option<String>,
}

/// Decode the `song` parameter of a raw query string.
///
/// Legacy encoder plugins escape latin-1 bytes, so a value that is not valid
/// UTF-8 once unescaped is read as ISO-8859-1.
fn song_from_query(raw: &str) -> Option<String> {
    let value = raw.split('&').find_map(|pair| pair.strip_prefix("song="))?;
    let bytes: Vec<u8> = percent_decode_str(&value.replace('+', " ")).collect();
    Some(match String::from_utf8(bytes) {
        Ok(song) => song,
        Err(e) => e.into_bytes().into_iter().map(char::from).collect(),
    })
}

/// `/admin.cgi`, as used by encoders and SHOUTcast tooling.
///
/// `updinfo` needs the DJ password; every other mode needs the admin one.
pub async fn shoutcast(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    RawQuery(raw): RawQuery,
    Query(query): Query<ShoutcastQuery>,
) -> Response {
    let mode = query.mode.as_deref().unwrap_or("index");
    let admin = mode != "updinfo";
    let password = query.pass.clone().unwrap_or_default();

    if !state.hooks.authenticate(Some(addr.ip()), password, admin).await {
        warn!("admin.cgi authentication failed for {}", addr.ip());
        return (StatusCode::FORBIDDEN, "Authentication failed.").into_response();
    }

    let result = match mode {
        "index" => return shoutcast_index(&state).await,
        "updinfo" => {
            let song = raw.as_deref().and_then(song_from_query).or(query.song).unwrap_or_default();
            state.stream.update_song_title(song).await.map(|_| ())
        }
        "kicksrc" => state.stream.kick_source().await.map(|_| ()),
        "kickdst" => {
            let Some(id) = query.dst.as_deref().and_then(|dst| dst.parse::<SessionId>().ok()) else {
                return (StatusCode::BAD_REQUEST, "Bad listener id.").into_response();
            };
            state.stream.kick_listener(id).await.map(|_| ())
        }
        _ => return (StatusCode::NOT_FOUND, "Not Found.").into_response(),
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn shoutcast_index(state: &AppState) -> Response {
    let (Ok(listeners), Ok(source)) = (state.stream.list_sessions().await, state.stream.current_source().await)
    else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let mut body = String::from("Clients:\n");
    for listener in &listeners {
        let _ = writeln!(body, "* {} [{}] - {} bytes", listener.id, listener.remote_ip, listener.bytes_sent);
    }
    let source = source.map(|s| s.address).unwrap_or_else(|| "None".to_string());
    let _ = write!(body, "\nSource: {}", source);
    (StatusCode::OK, body).into_response()
}
