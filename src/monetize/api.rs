use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use super::analysis::AnalysisService;
use super::assistant::ChatOrchestrator;
use super::db::DbHandle;
use super::models::*;
use super::partners;
use super::validation::{validate_display_name, validate_email};
use super::ws::{Event, broadcast_event};
use crate::errors::{AnalysisError, ChatError, GeocodeError, ValidationError};

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub analysis: Arc<AnalysisService>,
    pub chat: Arc<ChatOrchestrator>,
    pub referral_code: String,
    /// Admin routes answer 404 when this is unset.
    pub admin_token: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateAddressRequest {
    pub address: String,
    #[serde(default)]
    pub make_primary: bool,
}

/// Either free text (a new address is saved) or the id of a saved address
/// to re-analyse.
#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub address: Option<String>,
    pub address_id: Option<i64>,
    #[serde(default)]
    pub make_primary: bool,
}

#[derive(Deserialize)]
pub struct SelectAssetRequest {
    pub asset_type: AssetType,
    /// Defaults to the estimate in the analysis.
    pub monthly_revenue: Option<f64>,
}

#[derive(Deserialize)]
pub struct UpdateSelectionRequest {
    pub status: Option<SelectionStatus>,
    /// `null` clears the provider, absence leaves it alone.
    #[serde(default, deserialize_with = "double_option")]
    pub provider_id: Option<Option<i64>>,
}

#[derive(Deserialize)]
pub struct ProviderQuery {
    pub asset_type: Option<String>,
}

#[derive(Deserialize)]
pub struct JourneyRequest {
    pub step: JourneyStep,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub thread_id: Option<i64>,
    pub message: String,
}

#[derive(Deserialize)]
pub struct ToggleProviderRequest {
    pub is_active: bool,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ── Response types ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CreatedUser {
    pub user: User,
    /// Shown once; only its hash is stored.
    pub token: String,
}

#[derive(Serialize)]
pub struct AnalysisResponse {
    /// False when the analysis ran but could not be stored.
    pub saved: bool,
    pub address: Option<Address>,
    pub analysis: Option<PropertyAnalysis>,
    pub location: GeocodedAddress,
    pub report: PropertyReport,
}

#[derive(Serialize)]
pub struct ClickResponse {
    pub referral_url: String,
    pub click: PartnerClick,
}

#[derive(Serialize)]
pub struct ProviderWithReferral {
    #[serde(flatten)]
    pub provider: ServiceProvider,
    pub referral_url: String,
}

#[derive(Serialize)]
pub struct JourneyResponse {
    pub steps: Vec<JourneyEntry>,
    pub progress: JourneyProgress,
}

#[derive(Serialize)]
pub struct ChatHistory {
    pub thread: ChatThread,
    pub messages: Vec<ChatMessage>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        let msg = format!("{:#}", e);
        if msg.contains("not found") {
            ApiError::NotFound(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::Validation(v) => v.into(),
            AnalysisError::Geocode(GeocodeError::NotFound { .. }) => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Validation(v) => v.into(),
            ChatError::ThreadNotFound { .. } => ApiError::NotFound(e.to_string()),
            ChatError::Other(inner) => inner.into(),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

// ── Authentication ────────────────────────────────────────────────────

/// SHA-256 hex digest under which bearer tokens are stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// The user behind `Authorization: Bearer <token>`.
pub struct AuthUser(pub User);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;

        let token_hash = hash_token(token);
        state
            .db
            .call(move |db| db.find_user_by_token_hash(&token_hash))
            .await?
            .map(AuthUser)
            .ok_or_else(|| ApiError::Unauthorized("Invalid token".into()))
    }
}

/// Guard for `/api/admin/*`.
pub struct AdminAuth;

impl FromRequestParts<SharedState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Err(ApiError::NotFound("Admin routes are disabled".into()));
        };
        let given = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        match given {
            Some(token) if token == expected => Ok(AdminAuth),
            Some(_) => Err(ApiError::Unauthorized("Invalid admin token".into())),
            None => Err(ApiError::Unauthorized("Missing admin token".into())),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/users", post(create_user))
        .route("/api/me", get(get_me))
        .route("/api/addresses", get(list_addresses).post(create_address))
        .route("/api/addresses/{id}", get(get_address).delete(delete_address))
        .route("/api/addresses/{id}/primary", post(set_primary_address))
        .route("/api/addresses/{id}/analysis", get(latest_address_analysis))
        .route("/api/analyses", post(analyze_property))
        .route("/api/analyses/{id}", get(get_analysis))
        .route(
            "/api/analyses/{id}/selections",
            get(list_selections).put(select_asset),
        )
        .route("/api/selections/{id}", patch(update_selection))
        .route("/api/providers", get(list_providers))
        .route("/api/providers/{id}/click", post(click_provider))
        .route("/api/journey", get(get_journey).post(record_journey))
        .route("/api/chat", post(send_chat))
        .route("/api/chat/{thread_id}", get(get_chat_history))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/admin/providers", get(admin_list_providers))
        .route("/api/admin/providers/sync", post(admin_sync_providers))
        .route("/api/admin/providers/{id}", patch(admin_toggle_provider))
        .route("/api/admin/clicks", get(admin_click_stats))
        .route("/api/admin/analyses", get(admin_list_analyses))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn owned_address(state: &SharedState, user_id: i64, id: i64) -> Result<Address, ApiError> {
    state
        .db
        .call(move |db| db.get_address(id))
        .await?
        .filter(|a| a.user_id == user_id)
        .ok_or_else(|| ApiError::NotFound(format!("Address {} not found", id)))
}

async fn owned_analysis(
    state: &SharedState,
    user_id: i64,
    id: i64,
) -> Result<PropertyAnalysis, ApiError> {
    state
        .db
        .call(move |db| db.get_analysis(id))
        .await?
        .filter(|a| a.user_id == user_id)
        .ok_or_else(|| ApiError::NotFound(format!("Analysis {} not found", id)))
}

async fn owned_selection(
    state: &SharedState,
    user_id: i64,
    id: i64,
) -> Result<AssetSelection, ApiError> {
    state
        .db
        .call(move |db| db.get_selection(id))
        .await?
        .filter(|s| s.user_id == user_id)
        .ok_or_else(|| ApiError::NotFound(format!("Asset selection {} not found", id)))
}

/// Record an implied journey step. Failure is logged, never surfaced.
async fn track_step(state: &SharedState, user_id: i64, step: JourneyStep) {
    match state
        .db
        .call(move |db| db.record_journey_step(user_id, step, None))
        .await
    {
        Ok(_) => broadcast_event(&state.ws_tx, &Event::JourneyStepRecorded { user_id, step }),
        Err(e) => tracing::warn!(user_id, step = %step, error = %e, "Failed to record journey step"),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_user(
    State(state): State<SharedState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = validate_email(&req.email)?;
    let display_name = validate_display_name(req.display_name.as_deref())?;
    let token = uuid::Uuid::new_v4().simple().to_string();
    let token_hash = hash_token(&token);

    let user = state
        .db
        .call(move |db| {
            if db.get_user_by_email(&email)?.is_some() {
                return Ok(None);
            }
            db.create_user(&email, display_name.as_deref(), &token_hash)
                .map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::BadRequest("Email is already registered".into()))?;

    tracing::info!(user_id = user.id, "User created");
    Ok((StatusCode::CREATED, Json(CreatedUser { user, token })))
}

async fn get_me(AuthUser(user): AuthUser) -> Json<User> {
    Json(user)
}

async fn list_addresses(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let addresses = state.db.call(move |db| db.list_addresses(user.id)).await?;
    Ok(Json(addresses))
}

async fn create_address(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateAddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let location = state.analysis.resolve(&req.address).await?;
    let make_primary = req.make_primary;
    let address = state
        .db
        .call(move |db| db.create_address(user.id, &location, make_primary))
        .await?;

    broadcast_event(
        &state.ws_tx,
        &Event::AddressCreated {
            address: address.clone(),
        },
    );
    track_step(&state, user.id, JourneyStep::AddressEntered).await;
    Ok((StatusCode::CREATED, Json(address)))
}

async fn get_address(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(owned_address(&state, user.id, id).await?))
}

async fn delete_address(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    owned_address(&state, user.id, id).await?;
    state.db.call(move |db| db.delete_address(id)).await?;

    // The oldest remaining address may have been promoted.
    if let Some(primary) = state.db.call(move |db| db.primary_address(user.id)).await? {
        broadcast_event(
            &state.ws_tx,
            &Event::PrimaryAddressChanged {
                user_id: user.id,
                address_id: primary.id,
            },
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_primary_address(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    owned_address(&state, user.id, id).await?;
    let address = state
        .db
        .call(move |db| db.set_primary_address(user.id, id))
        .await?;
    broadcast_event(
        &state.ws_tx,
        &Event::PrimaryAddressChanged {
            user_id: user.id,
            address_id: address.id,
        },
    );
    Ok(Json(address))
}

async fn latest_address_analysis(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    owned_address(&state, user.id, id).await?;
    let analysis = state
        .db
        .call(move |db| db.latest_analysis_for_address(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No analysis for address {}", id)))?;
    Ok(Json(analysis))
}

async fn analyze_property(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (text, existing) = match (req.address_id, req.address) {
        (Some(id), _) => {
            let address = owned_address(&state, user.id, id).await?;
            (address.location.formatted_address, Some(id))
        }
        (None, Some(text)) => (text, None),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Either address or address_id is required".into(),
            ));
        }
    };

    let outcome = state.analysis.analyze(&text).await?;
    let make_primary = req.make_primary;
    let user_id = user.id;

    let saved = {
        let outcome = outcome.clone();
        state
            .db
            .call(move |db| {
                db.save_analysis(
                    user_id,
                    existing,
                    &outcome.address,
                    &outcome.report,
                    make_primary,
                )
            })
            .await
    };
    let (address, analysis) = match saved {
        Ok((address, analysis)) => (Some(address), Some(analysis)),
        Err(e) => {
            tracing::error!(user_id, error = %e, "Failed to save analysis, returning it unsaved");
            (None, None)
        }
    };

    if let (Some(address), None) = (&address, existing) {
        broadcast_event(
            &state.ws_tx,
            &Event::AddressCreated {
                address: address.clone(),
            },
        );
    }
    broadcast_event(
        &state.ws_tx,
        &Event::AnalysisCompleted {
            user_id,
            analysis_id: analysis.as_ref().map(|a| a.id),
            address_id: address.as_ref().map(|a| a.id),
            total_monthly_revenue: outcome.report.total_monthly_revenue,
            source: outcome.report.source,
        },
    );

    Ok(Json(AnalysisResponse {
        saved: analysis.is_some(),
        address,
        analysis,
        location: outcome.address,
        report: outcome.report,
    }))
}

async fn get_analysis(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(owned_analysis(&state, user.id, id).await?))
}

async fn list_selections(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    owned_analysis(&state, user.id, id).await?;
    let selections = state.db.call(move |db| db.list_selections(id)).await?;
    Ok(Json(selections))
}

async fn select_asset(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<SelectAssetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let analysis = owned_analysis(&state, user.id, id).await?;
    let asset = req.asset_type;
    let revenue = match (req.monthly_revenue, analysis.report.opportunity(asset)) {
        (Some(revenue), _) => revenue,
        (None, Some(opportunity)) => opportunity.monthly_revenue,
        (None, None) => {
            return Err(ApiError::BadRequest(format!(
                "Analysis {} has no {} estimate; monthly_revenue is required",
                id, asset
            )));
        }
    };

    let selection = state
        .db
        .call(move |db| db.upsert_asset_selection(user.id, id, asset, revenue))
        .await?;
    broadcast_event(
        &state.ws_tx,
        &Event::SelectionUpdated {
            selection: selection.clone(),
        },
    );
    track_step(&state, user.id, JourneyStep::AssetsSelected).await;
    Ok(Json(selection))
}

async fn update_selection(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSelectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.status.is_none() && req.provider_id.is_none() {
        return Err(ApiError::BadRequest("Nothing to update".into()));
    }
    let current = owned_selection(&state, user.id, id).await?;

    if let Some(Some(provider_id)) = req.provider_id {
        let provider = state
            .db
            .call(move |db| db.get_provider(provider_id))
            .await?
            .ok_or_else(|| ApiError::BadRequest(format!("Provider {} does not exist", provider_id)))?;
        if provider.asset_type != current.asset_type {
            return Err(ApiError::BadRequest(format!(
                "Provider '{}' handles {}, not {}",
                provider.slug, provider.asset_type, current.asset_type
            )));
        }
    }

    let status = req.status;
    let provider = req.provider_id;
    let selection = state
        .db
        .call(move |db| db.update_selection(id, provider, status))
        .await?;

    tracing::info!(selection_id = id, status = %selection.status, "Asset selection updated");
    broadcast_event(
        &state.ws_tx,
        &Event::SelectionUpdated {
            selection: selection.clone(),
        },
    );
    Ok(Json(selection))
}

async fn list_providers(
    State(state): State<SharedState>,
    Query(query): Query<ProviderQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let asset = query
        .asset_type
        .as_deref()
        .map(AssetType::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let providers = state
        .db
        .call(move |db| db.list_providers(asset, false))
        .await?;
    Ok(Json(providers))
}

async fn click_provider(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = state
        .db
        .call(move |db| db.get_provider(id))
        .await?
        .filter(|p| p.is_active)
        .ok_or_else(|| ApiError::NotFound(format!("Provider {} not found", id)))?;

    let referral_url = partners::referral_url(&provider, &state.referral_code, user.id)?;
    let click = {
        let url = referral_url.clone();
        state
            .db
            .call(move |db| db.record_click(user.id, id, &url))
            .await?
    };

    tracing::info!(user_id = user.id, provider = %provider.slug, "Partner click recorded");
    broadcast_event(
        &state.ws_tx,
        &Event::PartnerClicked {
            user_id: user.id,
            provider_id: id,
        },
    );
    track_step(&state, user.id, JourneyStep::PartnerConnected).await;
    Ok(Json(ClickResponse {
        referral_url,
        click,
    }))
}

async fn get_journey(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let steps = state.db.call(move |db| db.list_journey_steps(user.id)).await?;
    let completed: Vec<JourneyStep> = steps.iter().map(|e| e.step).collect();
    Ok(Json(JourneyResponse {
        progress: JourneyProgress::from_steps(&completed),
        steps,
    }))
}

async fn record_journey(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<JourneyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let step = req.step;
    let metadata = req.metadata;
    let entry = state
        .db
        .call(move |db| db.record_journey_step(user.id, step, metadata.as_ref()))
        .await?;
    broadcast_event(
        &state.ws_tx,
        &Event::JourneyStepRecorded {
            user_id: user.id,
            step,
        },
    );
    Ok(Json(entry))
}

async fn send_chat(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reply = state.chat.send(user.id, req.thread_id, &req.message).await?;
    broadcast_event(
        &state.ws_tx,
        &Event::ChatMessage {
            user_id: user.id,
            thread_id: reply.thread.id,
            mode: reply.mode,
        },
    );
    Ok(Json(reply))
}

async fn get_chat_history(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(thread_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .db
        .call(move |db| {
            let Some(thread) = db.get_chat_thread(thread_id)?.filter(|t| t.user_id == user.id)
            else {
                return Ok(None);
            };
            let messages = db.list_chat_messages(thread.id)?;
            Ok(Some(ChatHistory { thread, messages }))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Chat thread {} not found", thread_id)))?;
    Ok(Json(history))
}

async fn get_dashboard(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let dashboard = state.db.call(move |db| db.dashboard(user.id)).await?;
    Ok(Json(dashboard))
}

// ── Admin ─────────────────────────────────────────────────────────────

async fn admin_list_providers(
    State(state): State<SharedState>,
    _admin: AdminAuth,
) -> Result<impl IntoResponse, ApiError> {
    let providers = state.db.call(|db| db.list_providers(None, true)).await?;
    let code = state.referral_code.clone();
    let providers = providers
        .into_iter()
        .map(|provider| {
            // Admin previews use user id 0.
            let referral_url = partners::referral_url(&provider, &code, 0)?;
            Ok(ProviderWithReferral {
                provider,
                referral_url,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(providers))
}

async fn admin_toggle_provider(
    State(state): State<SharedState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
    Json(req): Json<ToggleProviderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let active = req.is_active;
    let provider = state
        .db
        .call(move |db| db.set_provider_active(id, active))
        .await?;
    tracing::info!(provider = %provider.slug, active, "Provider toggled");
    Ok(Json(provider))
}

async fn admin_sync_providers(
    State(state): State<SharedState>,
    _admin: AdminAuth,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.db.call(partners::sync_partners).await?;
    broadcast_event(
        &state.ws_tx,
        &Event::ProvidersSynced {
            report: report.clone(),
        },
    );
    Ok(Json(report))
}

async fn admin_click_stats(
    State(state): State<SharedState>,
    _admin: AdminAuth,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.db.call(|db| db.click_stats()).await?;
    Ok(Json(stats))
}

async fn admin_list_analyses(
    State(state): State<SharedState>,
    _admin: AdminAuth,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let analyses = state.db.call(move |db| db.list_analyses(limit)).await?;
    Ok(Json(analyses))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssistantSection;
    use crate::monetize::db::PropyieldDb;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const ADMIN: &str = "admin-secret";

    fn test_state(admin_token: Option<&str>) -> SharedState {
        state_with_db(PropyieldDb::new_in_memory().unwrap(), admin_token)
    }

    fn state_with_db(db: PropyieldDb, admin_token: Option<&str>) -> SharedState {
        partners::sync_partners(&db).unwrap();
        let db = DbHandle::new(db);
        let (ws_tx, _) = broadcast::channel(64);
        let chat = ChatOrchestrator::new(
            db.clone(),
            None,
            "propyield".to_string(),
            &AssistantSection::default(),
        );
        Arc::new(AppState {
            db,
            ws_tx,
            analysis: Arc::new(AnalysisService::offline()),
            chat: Arc::new(chat),
            referral_code: "propyield".to_string(),
            admin_token: admin_token.map(String::from),
        })
    }

    fn test_app() -> Router {
        api_router().with_state(test_state(Some(ADMIN)))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn admin_get(app: &Router, uri: &str, token: Option<&str>) -> StatusCode {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(ADMIN_TOKEN_HEADER, token);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    async fn signup(app: &Router, email: &str) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/api/users",
            None,
            Some(json!({"email": email, "display_name": "Dana"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    async fn analyze(app: &Router, token: &str, address: &str) -> Value {
        let (status, body) = send(
            app,
            "POST",
            "/api/analyses",
            Some(token),
            Some(json!({"address": address})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_user_and_duplicate_email() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/users",
            None,
            Some(json!({"email": "Owner@Example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["email"], "owner@example.com");
        assert_eq!(body["token"].as_str().unwrap().len(), 32);

        let (status, body) = send(
            &app,
            "POST",
            "/api/users",
            None,
            Some(json!({"email": "owner@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("already registered"));
    }

    #[tokio::test]
    async fn test_create_user_rejects_bad_email() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/users",
            None,
            Some(json!({"email": "not-an-email"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("email"));
    }

    #[tokio::test]
    async fn test_auth_required() {
        let app = test_app();
        let (status, _) = send(&app, "GET", "/api/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, "GET", "/api/me", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = signup(&app, "me@example.com").await;
        let (status, body) = send(&app, "GET", "/api/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "me@example.com");
        assert_eq!(body["display_name"], "Dana");
    }

    #[tokio::test]
    async fn test_analyze_saves_mock_analysis() {
        let app = test_app();
        let token = signup(&app, "a@example.com").await;
        let body = analyze(&app, &token, "742 Evergreen Terrace, Springfield").await;

        assert_eq!(body["saved"], true);
        assert_eq!(body["report"]["source"], "mock");
        assert_eq!(body["address"]["is_primary"], true);
        assert_eq!(
            body["location"]["formatted_address"],
            "742 Evergreen Terrace, Springfield"
        );

        let items: f64 = body["report"]["opportunities"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|o| o["available"] == true)
            .map(|o| o["monthly_revenue"].as_f64().unwrap())
            .sum();
        let total = body["analysis"]["total_monthly_revenue"].as_f64().unwrap();
        assert!((items - total).abs() < 0.01);

        let (_, journey) = send(&app, "GET", "/api/journey", Some(&token), None).await;
        assert_eq!(journey["progress"]["percent_complete"], 40);
        assert_eq!(journey["progress"]["next_step"], "assets_selected");
    }

    #[tokio::test]
    async fn test_analyze_rejects_invalid_address() {
        let app = test_app();
        let token = signup(&app, "b@example.com").await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/analyses",
            Some(&token),
            Some(json!({"address": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/api/analyses", Some(&token), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reanalyze_saved_address() {
        let app = test_app();
        let token = signup(&app, "re@example.com").await;
        let first = analyze(&app, &token, "10 Downing Street, London").await;
        let address_id = first["address"]["id"].as_i64().unwrap();

        let (status, second) = send(
            &app,
            "POST",
            "/api/analyses",
            Some(&token),
            Some(json!({"address_id": address_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["address"]["id"], address_id);

        let (_, addresses) = send(&app, "GET", "/api/addresses", Some(&token), None).await;
        assert_eq!(addresses.as_array().unwrap().len(), 1);

        let (status, latest) = send(
            &app,
            "GET",
            &format!("/api/addresses/{}/analysis", address_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["id"], second["analysis"]["id"]);
    }

    #[tokio::test]
    async fn test_primary_address_switch() {
        let app = test_app();
        let token = signup(&app, "c@example.com").await;
        let (status, first) = send(
            &app,
            "POST",
            "/api/addresses",
            Some(&token),
            Some(json!({"address": "1 First Street"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["is_primary"], true);

        let (_, second) = send(
            &app,
            "POST",
            "/api/addresses",
            Some(&token),
            Some(json!({"address": "2 Second Street"})),
        )
        .await;
        assert_eq!(second["is_primary"], false);

        let second_id = second["id"].as_i64().unwrap();
        let (status, promoted) = send(
            &app,
            "POST",
            &format!("/api/addresses/{}/primary", second_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(promoted["is_primary"], true);

        let (_, list) = send(&app, "GET", "/api/addresses", Some(&token), None).await;
        let primaries: Vec<&Value> = list
            .as_array()
            .unwrap()
            .iter()
            .filter(|a| a["is_primary"] == true)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0]["id"], second_id);
    }

    #[tokio::test]
    async fn test_addresses_are_private() {
        let app = test_app();
        let owner = signup(&app, "owner@example.com").await;
        let other = signup(&app, "other@example.com").await;
        let body = analyze(&app, &owner, "5 Private Lane").await;
        let address_id = body["address"]["id"].as_i64().unwrap();
        let analysis_id = body["analysis"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/addresses/{}", address_id),
            Some(&other),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/analyses/{}", analysis_id),
            Some(&other),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_address() {
        let app = test_app();
        let token = signup(&app, "d@example.com").await;
        let body = analyze(&app, &token, "8 Gone Road").await;
        let id = body["address"]["id"].as_i64().unwrap();
        let analysis_id = body["analysis"]["id"].as_i64().unwrap();

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/addresses/{}", id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) =
            send(&app, "GET", &format!("/api/addresses/{}", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/analyses/{}", analysis_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_selection_status_toggle_persists() {
        let app = test_app();
        let token = signup(&app, "e@example.com").await;
        let body = analyze(&app, &token, "12 Solar Way").await;
        let analysis_id = body["analysis"]["id"].as_i64().unwrap();
        let uri = format!("/api/analyses/{}/selections", analysis_id);

        let (status, selection) = send(
            &app,
            "PUT",
            &uri,
            Some(&token),
            Some(json!({"asset_type": "solar_roof"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(selection["status"], "selected");
        let expected = body["report"]["opportunities"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["asset_type"] == "solar_roof")
            .unwrap()["monthly_revenue"]
            .clone();
        assert_eq!(selection["monthly_revenue"], expected);

        let selection_id = selection["id"].as_i64().unwrap();
        let (status, updated) = send(
            &app,
            "PATCH",
            &format!("/api/selections/{}", selection_id),
            Some(&token),
            Some(json!({"status": "paused"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "paused");

        let (_, list) = send(&app, "GET", &uri, Some(&token), None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["status"], "paused");

        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/api/selections/{}", selection_id),
            Some(&token),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_selection_provider_must_match_asset() {
        let app = test_app();
        let token = signup(&app, "f@example.com").await;
        let body = analyze(&app, &token, "14 Match Street").await;
        let analysis_id = body["analysis"]["id"].as_i64().unwrap();
        let (_, selection) = send(
            &app,
            "PUT",
            &format!("/api/analyses/{}/selections", analysis_id),
            Some(&token),
            Some(json!({"asset_type": "solar_roof"})),
        )
        .await;
        let selection_id = selection["id"].as_i64().unwrap();

        let (_, solar) = send(&app, "GET", "/api/providers?asset_type=solar_roof", None, None).await;
        let (_, pool) = send(&app, "GET", "/api/providers?asset_type=pool", None, None).await;
        let uri = format!("/api/selections/{}", selection_id);

        let (status, _) = send(
            &app,
            "PATCH",
            &uri,
            Some(&token),
            Some(json!({"provider_id": pool[0]["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, updated) = send(
            &app,
            "PATCH",
            &uri,
            Some(&token),
            Some(json!({"provider_id": solar[0]["id"], "status": "in_progress"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["provider_id"], solar[0]["id"]);
        assert_eq!(updated["status"], "in_progress");

        let (_, cleared) = send(&app, "PATCH", &uri, Some(&token), Some(json!({"provider_id": null}))).await;
        assert!(cleared["provider_id"].is_null());
        assert_eq!(cleared["status"], "in_progress");
    }

    #[tokio::test]
    async fn test_list_providers_filter() {
        let app = test_app();
        let (status, parking) =
            send(&app, "GET", "/api/providers?asset_type=parking", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let slugs: Vec<&str> = parking
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["slug"].as_str().unwrap())
            .collect();
        assert_eq!(slugs, vec!["spothero", "neighbor-parking"]);

        let (status, _) = send(&app, "GET", "/api/providers?asset_type=yacht", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, all) = send(&app, "GET", "/api/providers", None, None).await;
        assert_eq!(all.as_array().unwrap().len(), partners::partner_catalog().len());
    }

    #[tokio::test]
    async fn test_click_records_referral_and_journey() {
        let app = test_app();
        let token = signup(&app, "g@example.com").await;
        let (_, pool) = send(&app, "GET", "/api/providers?asset_type=pool", None, None).await;
        let provider_id = pool[0]["id"].as_i64().unwrap();

        let (status, click) = send(
            &app,
            "POST",
            &format!("/api/providers/{}/click", provider_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let url = click["referral_url"].as_str().unwrap();
        assert!(url.starts_with("https://swimply.com/host?"));
        assert!(url.contains("utm_source=propyield"));
        assert_eq!(click["click"]["provider_id"], provider_id);

        let (_, journey) = send(&app, "GET", "/api/journey", Some(&token), None).await;
        assert_eq!(journey["steps"][0]["step"], "partner_connected");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/admin/clicks")
                    .header(ADMIN_TOKEN_HEADER, ADMIN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let stats: Vec<ClickStats> = serde_json::from_slice(&bytes).unwrap();
        let swimply = stats.iter().find(|s| s.slug == "swimply").unwrap();
        assert_eq!(swimply.clicks, 1);
        assert_eq!(swimply.unique_users, 1);
    }

    #[tokio::test]
    async fn test_record_journey_step_is_idempotent() {
        let app = test_app();
        let token = signup(&app, "h@example.com").await;
        for _ in 0..2 {
            let (status, entry) = send(
                &app,
                "POST",
                "/api/journey",
                Some(&token),
                Some(json!({"step": "onboarding_completed", "metadata": {"via": "wizard"}})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(entry["metadata"]["via"], "wizard");
        }
        let (_, journey) = send(&app, "GET", "/api/journey", Some(&token), None).await;
        assert_eq!(journey["steps"].as_array().unwrap().len(), 1);
        assert_eq!(journey["progress"]["percent_complete"], 20);

        let (status, _) = send(
            &app,
            "POST",
            "/api/journey",
            Some(&token),
            Some(json!({"step": "teleported"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_local_chat_round_trip() {
        let app = test_app();
        let token = signup(&app, "i@example.com").await;
        let (status, reply) = send(
            &app,
            "POST",
            "/api/chat",
            Some(&token),
            Some(json!({"message": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["mode"], "local");
        assert!(reply["reply"]["content"].as_str().unwrap().starts_with("Hi Dana!"));

        let thread_id = reply["thread"]["id"].as_i64().unwrap();
        let (status, history) = send(
            &app,
            "GET",
            &format!("/api/chat/{}", thread_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");

        let other = signup(&app, "j@example.com").await;
        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/chat/{}", thread_id),
            Some(&other),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &app,
            "POST",
            "/api/chat",
            Some(&other),
            Some(json!({"thread_id": thread_id, "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_rejects_blank_message() {
        let app = test_app();
        let token = signup(&app, "k@example.com").await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/chat",
            Some(&token),
            Some(json!({"message": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dashboard_totals() {
        let app = test_app();
        let token = signup(&app, "l@example.com").await;
        let body = analyze(&app, &token, "99 Dashboard Drive").await;
        let analysis_id = body["analysis"]["id"].as_i64().unwrap();
        send(
            &app,
            "PUT",
            &format!("/api/analyses/{}/selections", analysis_id),
            Some(&token),
            Some(json!({"asset_type": "solar_roof", "monthly_revenue": 120.0})),
        )
        .await;

        let (status, dashboard) = send(&app, "GET", "/api/dashboard", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dashboard["selected_monthly_revenue"], 120.0);
        assert_eq!(
            dashboard["potential_monthly_revenue"],
            body["report"]["total_monthly_revenue"]
        );
        assert_eq!(dashboard["journey"]["percent_complete"], 60);
    }

    #[tokio::test]
    async fn test_admin_guard() {
        let app = test_app();
        assert_eq!(
            admin_get(&app, "/api/admin/providers", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            admin_get(&app, "/api/admin/providers", Some("wrong")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            admin_get(&app, "/api/admin/providers", Some(ADMIN)).await,
            StatusCode::OK
        );

        let disabled = api_router().with_state(test_state(None));
        assert_eq!(
            admin_get(&disabled, "/api/admin/providers", Some(ADMIN)).await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_admin_toggle_hides_provider() {
        let app = test_app();
        let (_, storage) = send(&app, "GET", "/api/providers?asset_type=storage", None, None).await;
        let id = storage[0]["id"].as_i64().unwrap();

        let request = Request::builder()
            .method("PATCH")
            .uri(format!("/api/admin/providers/{}", id))
            .header(ADMIN_TOKEN_HEADER, ADMIN)
            .header("content-type", "application/json")
            .body(Body::from(json!({"is_active": false}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, storage) = send(&app, "GET", "/api/providers?asset_type=storage", None, None).await;
        assert!(storage.as_array().unwrap().is_empty());

        // Sync keeps the admin's choice.
        let request = Request::builder()
            .method("POST")
            .uri("/api/admin/providers/sync")
            .header(ADMIN_TOKEN_HEADER, ADMIN)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let report: SyncReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report.inserted, 0);

        let (_, storage) = send(&app, "GET", "/api/providers?asset_type=storage", None, None).await;
        assert!(storage.as_array().unwrap().is_empty());

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/providers/{}/click", id),
            Some(&signup(&app, "m@example.com").await),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_lists_analyses() {
        let app = test_app();
        let token = signup(&app, "n@example.com").await;
        analyze(&app, &token, "1 Admin Row").await;
        analyze(&app, &token, "2 Admin Row").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/admin/analyses?limit=1")
                    .header(ADMIN_TOKEN_HEADER, ADMIN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let analyses: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(analyses.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_analysis_broadcasts_event() {
        let state = test_state(None);
        let mut rx = state.ws_tx.subscribe();
        let app = api_router().with_state(state);
        let token = signup(&app, "o@example.com").await;
        analyze(&app, &token, "3 Broadcast Blvd").await;

        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let value: Value = serde_json::from_str(&msg).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        assert!(types.contains(&"AddressCreated".to_string()));
        assert!(types.contains(&"AnalysisCompleted".to_string()));
    }

    #[tokio::test]
    async fn test_failed_save_returns_unsaved_report_and_keeps_no_address() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("propyield.db");
        let state = state_with_db(PropyieldDb::new(&path).unwrap(), None);
        let mut rx = state.ws_tx.subscribe();
        let app = api_router().with_state(state);
        let token = signup(&app, "o@example.com").await;

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_analyses BEFORE INSERT ON property_analyses
                 BEGIN SELECT RAISE(ABORT, 'analyses rejected'); END;",
            )
            .unwrap();

        let body = analyze(&app, &token, "8 Lost Lane").await;
        assert_eq!(body["saved"], false);
        assert!(body["address"].is_null());
        assert!(body["analysis"].is_null());
        assert!(body["report"]["total_monthly_revenue"].as_f64().unwrap() > 0.0);

        let (_, addresses) = send(&app, "GET", "/api/addresses", Some(&token), None).await;
        assert_eq!(addresses.as_array().unwrap().len(), 0);
        let (_, journey) = send(&app, "GET", "/api/journey", Some(&token), None).await;
        assert_eq!(journey["progress"]["percent_complete"], 0);

        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let value: Value = serde_json::from_str(&msg).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        assert!(!types.contains(&"AddressCreated".to_string()));
        assert!(types.contains(&"AnalysisCompleted".to_string()));
    }

    #[test]
    fn test_analysis_error_mapping() {
        let err: ApiError = AnalysisError::InvalidResponse("garbage".into()).into();
        assert!(matches!(err, ApiError::Upstream(_)));
        let err: ApiError = AnalysisError::Geocode(GeocodeError::NotFound {
            address: "x".into(),
        })
        .into();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err: ApiError = ChatError::ThreadNotFound { id: 3 }.into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
