//! Chat orchestration over a hosted assistant, with a local rule-based
//! fallback.
//!
//! Remote flow for one user message:
//!
//! ```text
//! add_message ─> create_run ─> poll get_run ──> completed ─> latest reply
//!                                   │  ▲
//!                   requires_action │  │ submit_tool_outputs
//!                                   ▼  │
//!                              ToolDispatcher
//! ```
//!
//! Any remote failure (transport, a run ending in failed/cancelled/expired,
//! or running out of polls) is logged and answered by [`LocalAssistant`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::db::DbHandle;
use super::models::*;
use super::partners;
use super::validation::validate_chat_message;
use crate::config::{AssistantSection, OpenAiSection};
use crate::errors::ChatError;

// ── Assistant API types ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }

    /// Statuses after which the run will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Incomplete
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequiredAction {
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as sent by the assistant.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Abstraction over the hosted assistant for testability.
/// Real implementation: `OpenAiAssistants`.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    async fn create_thread(&self) -> Result<String, ChatError>;

    async fn add_message(&self, thread_id: &str, content: &str) -> Result<(), ChatError>;

    async fn create_run(&self, thread_id: &str) -> Result<Run, ChatError>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ChatError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<Run, ChatError>;

    /// Text of the newest assistant message on the thread, if any.
    async fn latest_assistant_message(&self, thread_id: &str) -> Result<Option<String>, ChatError>;

    /// Ask the provider to stop a run. A thread with an active run accepts
    /// no new messages.
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ChatError>;
}

// ── OpenAI Assistants v2 client ──────────────────────────────────────

pub struct OpenAiAssistants {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    assistant_id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

impl OpenAiAssistants {
    pub fn new(api_key: String, assistant_id: String, config: &OpenAiSection) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "openai-beta",
            reqwest::header::HeaderValue::from_static("assistants=v2"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            assistant_id,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, body: &Value) -> Result<T, ChatError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ChatError::Api(e.to_string()))?;
        Self::decode(response).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ChatError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ChatError::Api(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ChatError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(300).collect::<String>()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ChatError::Api(format!("Invalid response body: {}", e)))
    }
}

/// Concatenated text parts of the newest assistant message. The list is
/// expected newest first.
fn newest_assistant_text(messages: MessageList) -> Option<String> {
    messages
        .data
        .into_iter()
        .find(|m| m.role == "assistant")
        .map(|m| {
            m.content
                .into_iter()
                .filter(|c| c.kind == "text")
                .filter_map(|c| c.text.map(|t| t.value))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|text| !text.trim().is_empty())
}

#[async_trait]
impl AssistantApi for OpenAiAssistants {
    async fn create_thread(&self) -> Result<String, ChatError> {
        let created: CreatedObject = self.post("/threads", &json!({})).await?;
        Ok(created.id)
    }

    async fn add_message(&self, thread_id: &str, content: &str) -> Result<(), ChatError> {
        let _: CreatedObject = self
            .post(
                &format!("/threads/{}/messages", thread_id),
                &json!({"role": "user", "content": content}),
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str) -> Result<Run, ChatError> {
        self.post(
            &format!("/threads/{}/runs", thread_id),
            &json!({"assistant_id": self.assistant_id}),
        )
        .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ChatError> {
        self.get(&format!("/threads/{}/runs/{}", thread_id, run_id))
            .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<Run, ChatError> {
        self.post(
            &format!("/threads/{}/runs/{}/submit_tool_outputs", thread_id, run_id),
            &json!({"tool_outputs": outputs}),
        )
        .await
    }

    async fn latest_assistant_message(&self, thread_id: &str) -> Result<Option<String>, ChatError> {
        let messages: MessageList = self
            .get(&format!("/threads/{}/messages?order=desc&limit=10", thread_id))
            .await?;
        Ok(newest_assistant_text(messages))
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ChatError> {
        let _: Run = self
            .post(&format!("/threads/{}/runs/{}/cancel", thread_id, run_id), &json!({}))
            .await?;
        Ok(())
    }
}

// ── Tool dispatch ────────────────────────────────────────────────────

pub const TOOL_NAMES: [&str; 5] = [
    "get_property_analysis",
    "save_asset_selection",
    "update_asset_status",
    "record_journey_step",
    "list_partners",
];

#[derive(Debug, Deserialize)]
struct GetAnalysisArgs {
    #[serde(default)]
    address_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SaveSelectionArgs {
    asset_type: String,
    #[serde(default)]
    analysis_id: Option<i64>,
    #[serde(default)]
    monthly_revenue: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct UpdateStatusArgs {
    selection_id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JourneyArgs {
    step: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListPartnersArgs {
    #[serde(default)]
    asset_type: Option<String>,
}

/// Runs assistant tool calls against the database on behalf of one user.
#[derive(Clone)]
pub struct ToolDispatcher {
    db: DbHandle,
    referral_code: String,
}

impl ToolDispatcher {
    pub fn new(db: DbHandle, referral_code: String) -> Self {
        Self { db, referral_code }
    }

    /// Execute one tool call and return its JSON output. Never fails: bad
    /// arguments, unknown tools and handler errors all become
    /// `{"error": ...}` outputs for the assistant to read.
    pub async fn dispatch(&self, user_id: i64, name: &str, arguments: &str) -> String {
        let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
        let result = match name {
            "get_property_analysis" => match serde_json::from_str(arguments) {
                Ok(args) => self.get_property_analysis(user_id, args).await,
                Err(e) => Err(invalid_arguments(e)),
            },
            "save_asset_selection" => match serde_json::from_str(arguments) {
                Ok(args) => self.save_asset_selection(user_id, args).await,
                Err(e) => Err(invalid_arguments(e)),
            },
            "update_asset_status" => match serde_json::from_str(arguments) {
                Ok(args) => self.update_asset_status(user_id, args).await,
                Err(e) => Err(invalid_arguments(e)),
            },
            "record_journey_step" => match serde_json::from_str(arguments) {
                Ok(args) => self.record_journey_step(user_id, args).await,
                Err(e) => Err(invalid_arguments(e)),
            },
            "list_partners" => match serde_json::from_str(arguments) {
                Ok(args) => self.list_partners(user_id, args).await,
                Err(e) => Err(invalid_arguments(e)),
            },
            other => Err(anyhow::anyhow!("unknown tool: {}", other)),
        };

        match result {
            Ok(value) => value.to_string(),
            Err(e) => {
                tracing::warn!(tool = name, user_id, error = %e, "Assistant tool call failed");
                json!({"error": e.to_string()}).to_string()
            }
        }
    }

    async fn get_property_analysis(&self, user_id: i64, args: GetAnalysisArgs) -> anyhow::Result<Value> {
        let analysis = self
            .db
            .call(move |db| match args.address_id {
                Some(address_id) => match db.get_address(address_id)? {
                    Some(address) if address.user_id == user_id => {
                        db.latest_analysis_for_address(address_id)
                    }
                    _ => anyhow::bail!("address {} not found", address_id),
                },
                None => db.latest_analysis_for_user(user_id),
            })
            .await?;
        match analysis {
            Some(analysis) => Ok(serde_json::to_value(analysis)?),
            None => Ok(json!({"error": "no property analysis yet"})),
        }
    }

    async fn save_asset_selection(&self, user_id: i64, args: SaveSelectionArgs) -> anyhow::Result<Value> {
        let asset_type = AssetType::from_str(&args.asset_type).map_err(|e| anyhow::anyhow!(e))?;
        let selection = self
            .db
            .call(move |db| {
                let analysis = match args.analysis_id {
                    Some(id) => db.get_analysis(id)?,
                    None => db.latest_analysis_for_user(user_id)?,
                }
                .filter(|a| a.user_id == user_id)
                .ok_or_else(|| anyhow::anyhow!("no property analysis to select from"))?;
                let revenue = args.monthly_revenue.unwrap_or_else(|| {
                    analysis
                        .report
                        .opportunity(asset_type)
                        .map(|o| o.monthly_revenue)
                        .unwrap_or(0.0)
                });
                let selection = db.upsert_asset_selection(user_id, analysis.id, asset_type, revenue)?;
                db.record_journey_step(user_id, JourneyStep::AssetsSelected, None)?;
                Ok(selection)
            })
            .await?;
        Ok(serde_json::to_value(selection)?)
    }

    async fn update_asset_status(&self, user_id: i64, args: UpdateStatusArgs) -> anyhow::Result<Value> {
        let status = SelectionStatus::from_str(&args.status).map_err(|e| anyhow::anyhow!(e))?;
        let selection = self
            .db
            .call(move |db| {
                match db.get_selection(args.selection_id)? {
                    Some(s) if s.user_id == user_id => {}
                    _ => anyhow::bail!("selection {} not found", args.selection_id),
                }
                db.update_selection_status(args.selection_id, status)
            })
            .await?;
        Ok(serde_json::to_value(selection)?)
    }

    async fn record_journey_step(&self, user_id: i64, args: JourneyArgs) -> anyhow::Result<Value> {
        let step = JourneyStep::from_str(&args.step).map_err(|e| anyhow::anyhow!(e))?;
        let entry = self
            .db
            .call(move |db| db.record_journey_step(user_id, step, args.metadata.as_ref()))
            .await?;
        Ok(serde_json::to_value(entry)?)
    }

    async fn list_partners(&self, user_id: i64, args: ListPartnersArgs) -> anyhow::Result<Value> {
        let asset_type = args
            .asset_type
            .as_deref()
            .map(AssetType::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?;
        let providers = self
            .db
            .call(move |db| match asset_type {
                Some(asset) => partners::recommend(db, asset),
                None => db.list_providers(None, false),
            })
            .await?;
        let listed = providers
            .iter()
            .map(|p| {
                let signup_url = partners::referral_url(p, &self.referral_code, user_id)?;
                Ok(json!({
                    "id": p.id,
                    "name": p.name,
                    "asset_type": p.asset_type,
                    "description": p.description,
                    "earnings_low": p.earnings_low,
                    "earnings_high": p.earnings_high,
                    "signup_url": signup_url,
                }))
            })
            .collect::<anyhow::Result<Vec<Value>>>()?;
        Ok(json!({"partners": listed}))
    }
}

fn invalid_arguments(e: serde_json::Error) -> anyhow::Error {
    anyhow::anyhow!("invalid arguments: {}", e)
}

// ── Local fallback ───────────────────────────────────────────────────

/// What the local assistant knows about the user when it answers.
#[derive(Debug, Clone, Default)]
pub struct LocalContext {
    pub display_name: Option<String>,
    pub latest_analysis: Option<PropertyAnalysis>,
    /// Active providers, in priority order per asset.
    pub providers: Vec<ServiceProvider>,
}

const ASSET_KEYWORDS: [(AssetType, &[&str]); 6] = [
    (AssetType::SolarRoof, &["solar", "roof", "panel", "panels", "sunrun"]),
    (
        AssetType::Parking,
        &["parking", "driveway", "park", "car", "cars", "spothero"],
    ),
    (AssetType::Pool, &["pool", "swim", "swimming", "swimply"]),
    (
        AssetType::Storage,
        &["storage", "garage", "basement", "attic", "shed", "store"],
    ),
    (
        AssetType::Bandwidth,
        &["bandwidth", "internet", "wifi", "honeygain", "packetstream"],
    ),
    (
        AssetType::ShortTermRental,
        &["airbnb", "rental", "rent", "room", "guest", "guests", "peerspace"],
    ),
];

const EARNINGS_KEYWORDS: [&str; 7] = ["earn", "earnings", "money", "income", "revenue", "total", "worth"];
const GREETING_KEYWORDS: [&str; 6] = ["hi", "hello", "hey", "help", "menu", "start"];

/// Keyword-driven replies used when the hosted assistant is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAssistant;

impl LocalAssistant {
    pub fn reply(&self, ctx: &LocalContext, text: &str) -> String {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |keywords: &[&str]| keywords.iter().any(|k| words.contains(k));

        if let Some((asset, _)) = ASSET_KEYWORDS.iter().find(|entry| has(entry.1)) {
            return self.asset_reply(ctx, *asset);
        }
        if has(&EARNINGS_KEYWORDS) || lowered.contains("how much") {
            return self.earnings_reply(ctx);
        }
        if has(&GREETING_KEYWORDS) || lowered.contains("what can you do") {
            return self.menu(ctx);
        }
        "I'm not sure I understood that. Ask me how much your property could earn, or about a \
         specific asset like solar, parking, a pool, storage, internet bandwidth or short-term rentals."
            .to_string()
    }

    fn menu(&self, ctx: &LocalContext) -> String {
        let greeting = match &ctx.display_name {
            Some(name) => format!("Hi {}!", name),
            None => "Hi!".to_string(),
        };
        format!(
            "{} I can help you turn your property into income. Try asking:\n\
             - How much could my property earn?\n\
             - Tell me about renting my parking space\n\
             - Is my roof good for solar?\n\
             - Which partners can I sign up with?",
            greeting
        )
    }

    fn earnings_reply(&self, ctx: &LocalContext) -> String {
        let Some(analysis) = &ctx.latest_analysis else {
            return "I don't have an analysis for your property yet. Enter your address and I'll \
                    estimate what each asset could earn."
                .to_string();
        };
        let mut top: Vec<&AssetOpportunity> = analysis
            .report
            .opportunities
            .iter()
            .filter(|o| o.available && o.monthly_revenue > 0.0)
            .collect();
        top.sort_by(|a, b| b.monthly_revenue.total_cmp(&a.monthly_revenue));

        let mut reply = format!(
            "Your property could earn about ${:.0} per month in total.",
            analysis.report.total_monthly_revenue
        );
        if !top.is_empty() {
            reply.push_str(" Your best opportunities:");
            for o in top.iter().take(3) {
                reply.push_str(&format!(
                    "\n- {}: ~${:.0}/month",
                    o.asset_type.label(),
                    o.monthly_revenue
                ));
            }
        }
        reply
    }

    fn asset_reply(&self, ctx: &LocalContext, asset: AssetType) -> String {
        let mut reply = match ctx
            .latest_analysis
            .as_ref()
            .and_then(|a| a.report.opportunity(asset))
        {
            Some(o) if o.available => format!(
                "{}: your property could earn about ${:.0} per month.",
                asset.label(),
                o.monthly_revenue
            ),
            Some(_) => format!(
                "{}: your analysis didn't find this opportunity at your property.",
                asset.label()
            ),
            None => format!(
                "{}: analyze your address to get an estimate for your property.",
                asset.label()
            ),
        };
        if let Some(partner) = ctx.providers.iter().find(|p| p.asset_type == asset) {
            reply.push_str(&format!(
                " A good place to start is {} ({}), typically ${:.0}-${:.0} per month.",
                partner.name, partner.description, partner.earnings_low, partner.earnings_high
            ));
        }
        reply
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub thread: ChatThread,
    pub user_message: ChatMessage,
    pub reply: ChatMessage,
    pub mode: ChatMode,
    /// Names of the tools the assistant invoked while answering.
    pub tools_called: Vec<String>,
}

pub struct ChatOrchestrator {
    db: DbHandle,
    api: Option<Arc<dyn AssistantApi>>,
    tools: ToolDispatcher,
    local: LocalAssistant,
    poll_interval: Duration,
    max_polls: u32,
}

impl ChatOrchestrator {
    pub fn new(
        db: DbHandle,
        api: Option<Arc<dyn AssistantApi>>,
        referral_code: String,
        settings: &AssistantSection,
    ) -> Self {
        Self {
            tools: ToolDispatcher::new(db.clone(), referral_code),
            db,
            api,
            local: LocalAssistant,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_polls: settings.max_polls.max(1),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.api.is_some()
    }

    /// Answer one user message, creating the thread when `thread_id` is None.
    /// Both the user message and the reply are stored before returning.
    pub async fn send(
        &self,
        user_id: i64,
        thread_id: Option<i64>,
        text: &str,
    ) -> Result<ChatReply, ChatError> {
        let text = validate_chat_message(text)?;

        let thread = match thread_id {
            Some(id) => self
                .db
                .call(move |db| db.get_chat_thread(id))
                .await?
                .filter(|t| t.user_id == user_id)
                .ok_or(ChatError::ThreadNotFound { id })?,
            None => {
                self.db
                    .call(move |db| db.create_chat_thread(user_id, None, ChatMode::Local))
                    .await?
            }
        };

        let user_message = {
            let text = text.clone();
            let thread_id = thread.id;
            self.db
                .call(move |db| db.add_chat_message(thread_id, ChatRole::User, &text))
                .await?
        };

        let (thread, remote) = match &self.api {
            Some(api) => match self.ask_remote(api.as_ref(), thread.clone(), user_id, &text).await {
                Ok((thread, reply, tools)) => (thread, Some((reply, tools))),
                Err(e) => {
                    tracing::warn!(thread_id = thread.id, error = %e, "Assistant unavailable, answering locally");
                    (thread, None)
                }
            },
            None => (thread, None),
        };

        let (content, mode, tools_called) = match remote {
            Some((reply, tools)) => (reply, ChatMode::Assistant, tools),
            None => {
                let ctx = self.local_context(user_id).await?;
                (self.local.reply(&ctx, &text), ChatMode::Local, Vec::new())
            }
        };

        let reply = {
            let thread_id = thread.id;
            self.db
                .call(move |db| db.add_chat_message(thread_id, ChatRole::Assistant, &content))
                .await?
        };

        Ok(ChatReply {
            thread,
            user_message,
            reply,
            mode,
            tools_called,
        })
    }

    /// Ensure the thread has a remote counterpart, then run the assistant.
    async fn ask_remote(
        &self,
        api: &dyn AssistantApi,
        thread: ChatThread,
        user_id: i64,
        text: &str,
    ) -> Result<(ChatThread, String, Vec<String>), ChatError> {
        let thread = match &thread.remote_thread_id {
            Some(_) => thread,
            None => {
                let remote = api.create_thread().await?;
                let id = thread.id;
                self.db
                    .call(move |db| db.update_chat_thread(id, Some(remote.as_str()), ChatMode::Assistant))
                    .await?
            }
        };
        let remote_id = thread
            .remote_thread_id
            .clone()
            .ok_or_else(|| ChatError::Api("thread has no remote id".to_string()))?;

        let (reply, tools) = self.run_to_completion(api, &remote_id, user_id, text).await?;
        Ok((thread, reply, tools))
    }

    async fn run_to_completion(
        &self,
        api: &dyn AssistantApi,
        remote_thread: &str,
        user_id: i64,
        text: &str,
    ) -> Result<(String, Vec<String>), ChatError> {
        api.add_message(remote_thread, text).await?;
        let mut run = api.create_run(remote_thread).await?;
        let mut tools_called = Vec::new();
        tracing::debug!(run_id = %run.id, "Assistant run created");

        for _ in 0..self.max_polls {
            match run.status {
                RunStatus::Completed => {
                    let reply = api
                        .latest_assistant_message(remote_thread)
                        .await?
                        .ok_or_else(|| ChatError::Api("run completed without a reply".to_string()))?;
                    return Ok((reply, tools_called));
                }
                RunStatus::RequiresAction => {
                    let calls = run
                        .required_action
                        .take()
                        .map(|a| a.submit_tool_outputs.tool_calls)
                        .unwrap_or_default();
                    let mut outputs = Vec::with_capacity(calls.len());
                    for call in calls {
                        tracing::info!(run_id = %run.id, tool = %call.function.name, "Dispatching assistant tool call");
                        let output = self
                            .tools
                            .dispatch(user_id, &call.function.name, &call.function.arguments)
                            .await;
                        tools_called.push(call.function.name);
                        outputs.push(ToolOutput {
                            tool_call_id: call.id,
                            output,
                        });
                    }
                    run = api.submit_tool_outputs(remote_thread, &run.id, outputs).await?;
                    continue;
                }
                status if status.is_terminal() => {
                    return Err(ChatError::RunEnded {
                        run_id: run.id,
                        status: status.as_str().to_string(),
                    });
                }
                _ => {}
            }
            tokio::time::sleep(self.poll_interval).await;
            run = api.get_run(remote_thread, &run.id).await?;
        }

        if let Err(e) = api.cancel_run(remote_thread, &run.id).await {
            tracing::warn!(run_id = %run.id, error = %e, "Failed to cancel timed-out assistant run");
        }
        Err(ChatError::RunTimedOut {
            run_id: run.id,
            polls: self.max_polls,
        })
    }

    async fn local_context(&self, user_id: i64) -> Result<LocalContext, ChatError> {
        let ctx = self
            .db
            .call(move |db| {
                let display_name = db.get_user(user_id)?.and_then(|u| u.display_name);
                let latest_analysis = match db.primary_address(user_id)? {
                    Some(address) => db.latest_analysis_for_address(address.id)?,
                    None => db.latest_analysis_for_user(user_id)?,
                };
                Ok(LocalContext {
                    display_name,
                    latest_analysis,
                    providers: db.list_providers(None, false)?,
                })
            })
            .await?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monetize::db::PropyieldDb;
    use crate::monetize::mock::MockAnalysisGenerator;
    use std::sync::Mutex;

    /// Scripted assistant: `runs` are returned in order from create_run,
    /// get_run and submit_tool_outputs.
    struct MockAssistantApi {
        runs: Mutex<Vec<Run>>,
        reply: Option<String>,
        fail_create_thread: bool,
        fail_cancel: bool,
        submitted: Mutex<Vec<ToolOutput>>,
        messages: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl MockAssistantApi {
        fn new(runs: Vec<Run>, reply: Option<&str>) -> Self {
            Self {
                runs: Mutex::new(runs),
                reply: reply.map(str::to_string),
                fail_create_thread: false,
                fail_cancel: false,
                submitted: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
            }
        }

        fn next_run(&self) -> Result<Run, ChatError> {
            let mut runs = self.runs.lock().unwrap();
            if runs.is_empty() {
                return Ok(run("run_1", RunStatus::InProgress));
            }
            Ok(runs.remove(0))
        }
    }

    #[async_trait]
    impl AssistantApi for MockAssistantApi {
        async fn create_thread(&self) -> Result<String, ChatError> {
            if self.fail_create_thread {
                return Err(ChatError::Api("HTTP 500: boom".into()));
            }
            Ok("thread_remote".to_string())
        }

        async fn add_message(&self, _thread_id: &str, content: &str) -> Result<(), ChatError> {
            self.messages.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn create_run(&self, _thread_id: &str) -> Result<Run, ChatError> {
            self.next_run()
        }

        async fn get_run(&self, _thread_id: &str, _run_id: &str) -> Result<Run, ChatError> {
            self.next_run()
        }

        async fn submit_tool_outputs(
            &self,
            _thread_id: &str,
            _run_id: &str,
            outputs: Vec<ToolOutput>,
        ) -> Result<Run, ChatError> {
            self.submitted.lock().unwrap().extend(outputs);
            self.next_run()
        }

        async fn latest_assistant_message(&self, _thread_id: &str) -> Result<Option<String>, ChatError> {
            Ok(self.reply.clone())
        }

        async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> Result<(), ChatError> {
            if self.fail_cancel {
                return Err(ChatError::Api("HTTP 400: run already finished".into()));
            }
            self.cancelled.lock().unwrap().push(run_id.to_string());
            Ok(())
        }
    }

    fn run(id: &str, status: RunStatus) -> Run {
        Run {
            id: id.to_string(),
            status,
            required_action: None,
        }
    }

    fn tool_run(calls: &[(&str, &str, &str)]) -> Run {
        Run {
            id: "run_1".to_string(),
            status: RunStatus::RequiresAction,
            required_action: Some(RequiredAction {
                submit_tool_outputs: SubmitToolOutputs {
                    tool_calls: calls
                        .iter()
                        .map(|(id, name, args)| ToolCall {
                            id: id.to_string(),
                            function: FunctionCall {
                                name: name.to_string(),
                                arguments: args.to_string(),
                            },
                        })
                        .collect(),
                },
            }),
        }
    }

    fn fast_settings() -> AssistantSection {
        AssistantSection {
            poll_interval_ms: 1,
            max_polls: 5,
        }
    }

    /// Database with one user, a primary address and a mock analysis.
    fn seeded_db() -> (DbHandle, i64, i64) {
        let db = PropyieldDb::new_in_memory().unwrap();
        let user = db
            .create_user("owner@example.com", Some("Sam"), "hash")
            .unwrap();
        let address = db
            .create_address(user.id, &GeocodedAddress::ungeocoded("12 Birch Rd"), false)
            .unwrap();
        let report = MockAnalysisGenerator.generate("12 Birch Rd");
        let analysis = db.insert_analysis(address.id, user.id, &report).unwrap();
        partners::sync_partners(&db).unwrap();
        (DbHandle::new(db), user.id, analysis.id)
    }

    fn orchestrator(db: &DbHandle, api: Option<Arc<dyn AssistantApi>>) -> ChatOrchestrator {
        ChatOrchestrator::new(db.clone(), api, "propyield".into(), &fast_settings())
    }

    #[test]
    fn test_run_status_terminal_set() {
        for s in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Expired,
            RunStatus::Incomplete,
        ] {
            assert!(s.is_terminal(), "{} should be terminal", s.as_str());
        }
        for s in [
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::RequiresAction,
            RunStatus::Cancelling,
        ] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn test_run_deserializes_tool_calls_and_unknown_status() {
        let json = r#"{
            "id": "run_abc",
            "object": "thread.run",
            "status": "requires_action",
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "list_partners", "arguments": "{\"asset_type\":\"pool\"}"}
                    }]
                }
            }
        }"#;
        let run: Run = serde_json::from_str(json).unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction);
        let calls = run.required_action.unwrap().submit_tool_outputs.tool_calls;
        assert_eq!(calls[0].function.name, "list_partners");

        let odd: Run = serde_json::from_str(r#"{"id": "r", "status": "paused_forever"}"#).unwrap();
        assert_eq!(odd.status, RunStatus::Unknown);
    }

    #[test]
    fn test_newest_assistant_text() {
        let list: MessageList = serde_json::from_str(
            r#"{"data": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": {"value": "Part one", "annotations": []}},
                    {"type": "image_file"},
                    {"type": "text", "text": {"value": "Part two", "annotations": []}}
                ]},
                {"role": "user", "content": [{"type": "text", "text": {"value": "hi"}}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(newest_assistant_text(list).as_deref(), Some("Part one\nPart two"));

        let only_user: MessageList = serde_json::from_str(
            r#"{"data": [{"role": "user", "content": [{"type": "text", "text": {"value": "hi"}}]}]}"#,
        )
        .unwrap();
        assert!(newest_assistant_text(only_user).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let (db, user_id, _) = seeded_db();
        let tools = ToolDispatcher::new(db, "propyield".into());
        let out: Value = serde_json::from_str(&tools.dispatch(user_id, "launch_rocket", "{}").await).unwrap();
        assert_eq!(out["error"], "unknown tool: launch_rocket");
    }

    #[tokio::test]
    async fn test_dispatch_invalid_arguments_is_error_output() {
        let (db, user_id, _) = seeded_db();
        let tools = ToolDispatcher::new(db, "propyield".into());
        let out: Value =
            serde_json::from_str(&tools.dispatch(user_id, "update_asset_status", "{oops").await).unwrap();
        assert!(out["error"].as_str().unwrap().starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_dispatch_selection_tools() {
        let (db, user_id, analysis_id) = seeded_db();
        let tools = ToolDispatcher::new(db.clone(), "propyield".into());

        let saved: Value = serde_json::from_str(
            &tools
                .dispatch(user_id, "save_asset_selection", r#"{"asset_type": "bandwidth"}"#)
                .await,
        )
        .unwrap();
        assert_eq!(saved["analysis_id"], analysis_id);
        assert_eq!(saved["status"], "selected");
        let selection_id = saved["id"].as_i64().unwrap();

        let updated: Value = serde_json::from_str(
            &tools
                .dispatch(
                    user_id,
                    "update_asset_status",
                    &json!({"selection_id": selection_id, "status": "active"}).to_string(),
                )
                .await,
        )
        .unwrap();
        assert_eq!(updated["status"], "active");

        let persisted = db
            .call(move |db| db.get_selection(selection_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.status, SelectionStatus::Active);

        // Selecting records the journey step too
        let steps = db.call(move |db| db.list_journey_steps(user_id)).await.unwrap();
        assert!(steps.iter().any(|s| s.step == JourneyStep::AssetsSelected));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_other_users_selection() {
        let (db, user_id, _) = seeded_db();
        let tools = ToolDispatcher::new(db.clone(), "propyield".into());
        let saved: Value = serde_json::from_str(
            &tools
                .dispatch(user_id, "save_asset_selection", r#"{"asset_type": "pool"}"#)
                .await,
        )
        .unwrap();
        let other = db
            .call(|db| db.create_user("other@example.com", None, "other"))
            .await
            .unwrap();
        let out: Value = serde_json::from_str(
            &tools
                .dispatch(
                    other.id,
                    "update_asset_status",
                    &json!({"selection_id": saved["id"], "status": "paused"}).to_string(),
                )
                .await,
        )
        .unwrap();
        assert!(out["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_dispatch_list_partners_and_journey() {
        let (db, user_id, _) = seeded_db();
        let tools = ToolDispatcher::new(db, "abc".into());
        let out: Value = serde_json::from_str(
            &tools
                .dispatch(user_id, "list_partners", r#"{"asset_type": "pool"}"#)
                .await,
        )
        .unwrap();
        let partners = out["partners"].as_array().unwrap();
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0]["name"], "Swimply");
        assert!(partners[0]["signup_url"].as_str().unwrap().contains("ref=abc-"));

        let step: Value = serde_json::from_str(
            &tools
                .dispatch(user_id, "record_journey_step", r#"{"step": "analysis_viewed"}"#)
                .await,
        )
        .unwrap();
        assert_eq!(step["step"], "analysis_viewed");

        let analysis: Value =
            serde_json::from_str(&tools.dispatch(user_id, "get_property_analysis", "").await).unwrap();
        assert_eq!(analysis["source"], "mock");
    }

    #[test]
    fn test_local_assistant_rules() {
        let report = MockAnalysisGenerator.generate("12 Birch Rd");
        let ctx = LocalContext {
            display_name: Some("Sam".into()),
            latest_analysis: Some(PropertyAnalysis {
                id: 1,
                address_id: 1,
                user_id: 1,
                report,
                created_at: "2024-01-01".into(),
            }),
            providers: Vec::new(),
        };
        let local = LocalAssistant;

        assert!(local.reply(&ctx, "hello there").starts_with("Hi Sam!"));
        assert!(local.reply(&ctx, "How much could I make?").contains("per month in total"));
        assert!(local.reply(&ctx, "Tell me about solar").starts_with("Rooftop solar"));
        assert!(local.reply(&ctx, "can I rent my driveway?").starts_with("Parking"));
        assert!(local.reply(&ctx, "xyzzy").contains("not sure"));
        // "this" must not match the "hi" greeting
        assert!(local.reply(&ctx, "this").contains("not sure"));
    }

    #[test]
    fn test_local_assistant_without_analysis() {
        let local = LocalAssistant;
        let ctx = LocalContext::default();
        assert!(local.reply(&ctx, "what will I earn").contains("don't have an analysis"));
        assert!(local.reply(&ctx, "pool?").contains("analyze your address"));
        assert!(local.reply(&ctx, "help").starts_with("Hi!"));
    }

    #[tokio::test]
    async fn test_send_without_api_uses_local_and_persists() {
        let (db, user_id, _) = seeded_db();
        let chat = orchestrator(&db, None);
        let reply = chat.send(user_id, None, "hi").await.unwrap();
        assert_eq!(reply.mode, ChatMode::Local);
        assert!(reply.reply.content.contains("Hi Sam!"));

        let thread_id = reply.thread.id;
        let again = chat.send(user_id, Some(thread_id), "solar?").await.unwrap();
        assert_eq!(again.thread.id, thread_id);

        let messages = db.call(move |db| db.list_chat_messages(thread_id)).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[3].role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn test_send_rejects_foreign_thread_and_empty_message() {
        let (db, user_id, _) = seeded_db();
        let chat = orchestrator(&db, None);
        let reply = chat.send(user_id, None, "hi").await.unwrap();
        let other = db
            .call(|db| db.create_user("x@example.com", None, "x"))
            .await
            .unwrap();
        assert!(matches!(
            chat.send(other.id, Some(reply.thread.id), "hi").await,
            Err(ChatError::ThreadNotFound { .. })
        ));
        assert!(matches!(
            chat.send(user_id, None, "   ").await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_remote_completed() {
        let (db, user_id, _) = seeded_db();
        let api = Arc::new(MockAssistantApi::new(
            vec![
                run("run_1", RunStatus::Queued),
                run("run_1", RunStatus::InProgress),
                run("run_1", RunStatus::Completed),
            ],
            Some("Your roof looks great for solar."),
        ));
        let chat = orchestrator(&db, Some(api.clone()));
        let reply = chat.send(user_id, None, "is my roof good?").await.unwrap();
        assert_eq!(reply.mode, ChatMode::Assistant);
        assert_eq!(reply.reply.content, "Your roof looks great for solar.");
        assert_eq!(reply.thread.remote_thread_id.as_deref(), Some("thread_remote"));
        assert_eq!(api.messages.lock().unwrap().as_slice(), ["is my roof good?"]);
    }

    #[tokio::test]
    async fn test_send_remote_dispatches_tools() {
        let (db, user_id, _) = seeded_db();
        let api = Arc::new(MockAssistantApi::new(
            vec![
                tool_run(&[
                    ("call_1", "save_asset_selection", r#"{"asset_type": "parking"}"#),
                    ("call_2", "teleport", "{}"),
                ]),
                run("run_1", RunStatus::Completed),
            ],
            Some("Saved your parking selection."),
        ));
        let chat = orchestrator(&db, Some(api.clone()));
        let reply = chat.send(user_id, None, "select parking").await.unwrap();
        assert_eq!(reply.mode, ChatMode::Assistant);
        assert_eq!(reply.tools_called, vec!["save_asset_selection", "teleport"]);

        let submitted = api.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].tool_call_id, "call_1");
        assert!(submitted[0].output.contains("\"asset_type\":\"parking\""));
        assert!(submitted[1].output.contains("unknown tool: teleport"));
    }

    #[tokio::test]
    async fn test_send_remote_failed_run_falls_back() {
        let (db, user_id, _) = seeded_db();
        let api = Arc::new(MockAssistantApi::new(
            vec![run("run_1", RunStatus::Failed)],
            None,
        ));
        let chat = orchestrator(&db, Some(api));
        let reply = chat.send(user_id, None, "hello").await.unwrap();
        assert_eq!(reply.mode, ChatMode::Local);
        assert!(reply.reply.content.starts_with("Hi Sam!"));
    }

    #[tokio::test]
    async fn test_send_remote_timeout_falls_back() {
        let (db, user_id, _) = seeded_db();
        // Script is empty: every poll reports in_progress
        let api = Arc::new(MockAssistantApi::new(Vec::new(), None));
        let chat = orchestrator(&db, Some(api));
        let reply = chat.send(user_id, None, "how much can I earn").await.unwrap();
        assert_eq!(reply.mode, ChatMode::Local);
        assert!(reply.reply.content.contains("per month in total"));
    }

    #[tokio::test]
    async fn test_send_remote_thread_creation_failure_falls_back() {
        let (db, user_id, _) = seeded_db();
        let mut api = MockAssistantApi::new(Vec::new(), None);
        api.fail_create_thread = true;
        let chat = orchestrator(&db, Some(Arc::new(api)));
        let reply = chat.send(user_id, None, "hi").await.unwrap();
        assert_eq!(reply.mode, ChatMode::Local);
        assert!(reply.thread.remote_thread_id.is_none());
    }

    #[tokio::test]
    async fn test_run_to_completion_reports_timeout() {
        let (db, user_id, _) = seeded_db();
        let api = MockAssistantApi::new(Vec::new(), None);
        let chat = orchestrator(&db, None);
        let err = chat
            .run_to_completion(&api, "thread_remote", user_id, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RunTimedOut { polls: 5, .. }));
        assert_eq!(*api.cancelled.lock().unwrap(), vec!["run_1".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_survives_failed_cancel() {
        let (db, user_id, _) = seeded_db();
        let mut api = MockAssistantApi::new(Vec::new(), None);
        api.fail_cancel = true;
        let chat = orchestrator(&db, None);
        let err = chat
            .run_to_completion(&api, "thread_remote", user_id, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RunTimedOut { .. }));
    }

    #[tokio::test]
    async fn test_completed_run_is_not_cancelled() {
        let (db, user_id, _) = seeded_db();
        let api = MockAssistantApi::new(vec![run("run_1", RunStatus::Completed)], Some("Done"));
        let chat = orchestrator(&db, None);
        let (reply, _) = chat
            .run_to_completion(&api, "thread_remote", user_id, "hi")
            .await
            .unwrap();
        assert_eq!(reply, "Done");
        assert!(api.cancelled.lock().unwrap().is_empty());
    }
}
