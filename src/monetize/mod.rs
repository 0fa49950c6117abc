//! Property monetization back-end.
//!
//! ## Overview
//!
//! An owner enters an address; the analysis pipeline estimates what each
//! asset on the property (roof, driveway, pool, spare space, bandwidth, the
//! home itself) could earn per month and stores the report. The owner then
//! selects assets, follows referral links to partner platforms, and can ask
//! the assistant about any of it. Every change is pushed over a WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  (SPA)   │ <─────── │    └─ api.rs  (route handlers, AppState, auth)   │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ AnalysisService::analyze()             │
//!                       │         v                                        │
//!                       │  analysis.rs ──> geocode.rs  (Geocoder trait)    │
//!                       │       │     ──> llm.rs      (LlmClient trait)    │
//!                       │       │     ──> mock.rs     (quota fallback)     │
//!                       │       └─────> revenue.rs    (clamping, totals)   │
//!                       │                                                  │
//!                       │         │ ChatOrchestrator::send()               │
//!                       │         v                                        │
//!                       │  assistant.rs (AssistantApi trait, tool calls,   │
//!                       │                local rule-based fallback)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module           | Responsibility                                        |
//! |------------------|-------------------------------------------------------|
//! | `models`         | Shared types: `AssetType`, `PropertyReport`, rows     |
//! | `db`             | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)   |
//! | `validation`     | Form validation for addresses, emails, chat text      |
//! | `partners`       | Partner catalog, sync job, referral links             |
//! | `journey`        | Onboarding progress from recorded steps               |
//! | `ws`             | `Event` enum + `broadcast_event()` helper             |
//!
//! ## Typical Request Flow (analyse an address)
//!
//! 1. `POST /api/analyses` → `api::analyze_property()`
//! 2. `AnalysisService` validates the text and geocodes it (skipped without a
//!    maps key; quota errors degrade to an ungeocoded address).
//! 3. With coordinates, a satellite image is fetched and attached to the
//!    prompt; a failed fetch continues text-only.
//! 4. The model's JSON is parsed and every line item clamped to its asset's
//!    bounds. Exhausted quota switches to the mock generator instead.
//! 5. The address and report are saved in one go; if saving fails the report
//!    is still returned with `saved: false`.
//! 6. `AnalysisCompleted` is broadcast to every WebSocket client.

pub mod analysis;
pub mod api;
pub mod assistant;
pub mod db;
pub mod geocode;
pub mod journey;
pub mod llm;
pub mod mock;
pub mod models;
pub mod partners;
pub mod revenue;
pub mod server;
pub mod validation;
pub mod ws;
