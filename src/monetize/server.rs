use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::analysis::AnalysisService;
use super::api::{self, AppState};
use super::assistant::{AssistantApi, ChatOrchestrator, OpenAiAssistants};
use super::db::{DbHandle, PropyieldDb};
use super::geocode::{Geocoder, GoogleGeocoder};
use super::llm::{LlmClient, OpenAiClient};
use super::partners;
use super::ws;
use crate::config::PropyieldToml;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub settings: PropyieldToml,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = PropyieldToml::default();
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            db_path: settings.server.db_path.clone(),
            dev_mode: settings.server.dev_mode,
            settings,
        }
    }
}

/// Build the full application router: API routes plus the `/ws` feed.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Analysis pipeline wired to whichever providers have keys configured.
pub fn analysis_service(settings: &PropyieldToml) -> Result<AnalysisService> {
    let maps_key = settings.maps_api_key();
    let geocoder: Option<Arc<dyn Geocoder>> = match &maps_key {
        Some(key) => Some(Arc::new(GoogleGeocoder::new(key.clone(), &settings.maps)?)),
        None => None,
    };
    let llm: Option<Arc<dyn LlmClient>> = match settings.openai_api_key() {
        Some(key) => Some(Arc::new(OpenAiClient::new(key, &settings.openai)?)),
        None => None,
    };
    tracing::debug!(
        geocoding = geocoder.is_some(),
        language_model = llm.is_some(),
        force_mock = settings.analysis.force_mock,
        "Analysis service configured"
    );
    Ok(AnalysisService::new(
        geocoder,
        llm,
        settings.maps.clone(),
        maps_key,
        settings.analysis.clone(),
    ))
}

/// Chat orchestrator; remote only when both an API key and an assistant id
/// are configured.
pub fn chat_orchestrator(db: DbHandle, settings: &PropyieldToml) -> Result<ChatOrchestrator> {
    let api: Option<Arc<dyn AssistantApi>> =
        match (settings.openai_api_key(), settings.assistant_id()) {
            (Some(key), Some(assistant_id)) => Some(Arc::new(OpenAiAssistants::new(
                key,
                assistant_id,
                &settings.openai,
            )?)),
            _ => None,
        };
    Ok(ChatOrchestrator::new(
        db,
        api,
        settings.partners.referral_code.clone(),
        &settings.assistant,
    ))
}

/// Start the HTTP server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = PropyieldDb::new(&config.db_path).context("Failed to initialize database")?;
    let report = partners::sync_partners(&db).context("Failed to sync partner catalog")?;
    tracing::debug!(?report, "Partner catalog ready");
    let db = DbHandle::new(db);

    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let settings = &config.settings;
    let chat = chat_orchestrator(db.clone(), settings)?;
    if !chat.is_remote() {
        tracing::info!("No assistant configured, chat uses the local assistant");
    }

    let state = Arc::new(AppState {
        db,
        ws_tx,
        analysis: Arc::new(analysis_service(settings)?),
        chat: Arc::new(chat),
        referral_code: settings.partners.referral_code.clone(),
        admin_token: settings.admin_token(),
    });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { config.host.as_str() };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db = %config.db_path.display(), "propyield listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = PropyieldDb::new_in_memory().unwrap();
        partners::sync_partners(&db).unwrap();
        let db = DbHandle::new(db);
        let settings = PropyieldToml::default();
        let (ws_tx, _) = broadcast::channel(16);
        let state = Arc::new(AppState {
            chat: Arc::new(chat_orchestrator(db.clone(), &settings).unwrap()),
            db,
            ws_tx,
            analysis: Arc::new(AnalysisService::offline()),
            referral_code: "propyield".to_string(),
            admin_token: None,
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/providers")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let providers: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            providers.as_array().unwrap().len(),
            partners::partner_catalog().len()
        );
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        // A plain GET without upgrade headers is rejected by the extractor.
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.db_path, PathBuf::from(".propyield/propyield.db"));
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_services_build_from_default_settings() {
        let settings = PropyieldToml::default();
        let db = DbHandle::new(PropyieldDb::new_in_memory().unwrap());
        assert!(chat_orchestrator(db, &settings).is_ok());
        assert!(analysis_service(&settings).is_ok());
    }
}
