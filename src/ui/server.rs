//! Admin HTTP server

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::SharedHooks;
use crate::config::AdminConfig;
use crate::error::{NetworkError, Result};
use crate::stream::StreamHandle;
use crate::ui::handlers;

/// State shared by all handlers
pub struct AppState {
    pub stream: StreamHandle,
    pub hooks: SharedHooks,
}

/// Build the admin router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/status", get(handlers::get_status))
        .route("/admin/song", post(handlers::update_song))
        .route("/admin/kick-source", post(handlers::kick_source))
        .route("/admin/kick-listener/:id", post(handlers::kick_listener))
        .route("/admin.cgi", get(handlers::shoutcast))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the admin API on its own port
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AppState>,
}

impl AdminServer {
    pub fn new(config: AdminConfig, stream: StreamHandle, hooks: SharedHooks) -> Self {
        Self {
            config,
            state: Arc::new(AppState { stream, hooks }),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.addr()?;
        TcpListener::bind(addr).await.map_err(|source| {
            NetworkError::BindFailed {
                addr: addr.to_string(),
                source,
            }
            .into()
        })
    }

    /// Serve on an already bound listener
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        info!("Admin API on http://{}", listener.local_addr()?);
        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordAuthenticator;
    use crate::config::{PasswordConfig, StreamConfig};
    use crate::stream::StreamCore;
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    const ADMIN_AUTH: &str = "Basic YWRtaW46YWRtaW4=";
    const WRONG_AUTH: &str = "Basic YWRtaW46d3Jvbmc=";

    fn app() -> (Router, StreamHandle) {
        let hooks: SharedHooks = Arc::new(PasswordAuthenticator::new(&PasswordConfig {
            dj: "dj".into(),
            admin: "admin".into(),
            strict_admin: false,
        }));
        let (core, stream) = StreamCore::new(&StreamConfig::default(), hooks.clone());
        tokio::spawn(core.run());

        let state = Arc::new(AppState {
            stream: stream.clone(),
            hooks,
        });
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (router(state).layer(MockConnectInfo(remote)), stream)
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_status_requires_auth() {
        let (app, _stream) = app();

        let response = app
            .clone()
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get("/admin/status")
                    .header(header::AUTHORIZATION, WRONG_AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_status_report() {
        let (app, _stream) = app();
        let response = app
            .oneshot(
                Request::get("/admin/status")
                    .header(header::AUTHORIZATION, ADMIN_AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["metadata"]["station_name"], "N/A");
        assert!(json["data"]["source"].is_null());
        assert_eq!(json["data"]["listeners"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_update_song() {
        let (app, stream) = app();
        let response = app
            .oneshot(
                Request::post("/admin/song")
                    .header(header::AUTHORIZATION, ADMIN_AUTH)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"title":"Night Drive"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stream.metadata().song_title, "Night Drive");
    }

    #[tokio::test]
    async fn test_kick_unknown_listener() {
        let (app, _stream) = app();
        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/admin/kick-listener/{}", crate::clients::SessionId::random()))
                    .header(header::AUTHORIZATION, ADMIN_AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/admin/kick-listener/garbage")
                    .header(header::AUTHORIZATION, ADMIN_AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_shoutcast_updinfo_with_dj_password() {
        let (app, stream) = app();
        let response = app
            .oneshot(
                Request::get("/admin.cgi?mode=updinfo&pass=dj&song=Artist%20-%20Title")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stream.metadata().song_title, "Artist - Title");
    }

    #[tokio::test]
    async fn test_shoutcast_updinfo_latin1_title() {
        let (app, stream) = app();
        let response = app
            .oneshot(
                Request::get("/admin.cgi?mode=updinfo&pass=dj&song=Caf%E9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stream.metadata().song_title, "Café");
    }

    #[tokio::test]
    async fn test_shoutcast_index_needs_admin() {
        let (app, _stream) = app();
        let response = app
            .clone()
            .oneshot(Request::get("/admin.cgi?pass=dj").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(Request::get("/admin.cgi?pass=admin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Clients:\n\nSource: None");
    }

    #[tokio::test]
    async fn test_shoutcast_unknown_mode() {
        let (app, _stream) = app();
        let response = app
            .oneshot(
                Request::get("/admin.cgi?mode=reboot&pass=admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
