use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A monetizable feature of a property.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    SolarRoof,
    Parking,
    Pool,
    Storage,
    Bandwidth,
    ShortTermRental,
}

impl AssetType {
    pub const ALL: [AssetType; 6] = [
        AssetType::SolarRoof,
        AssetType::Parking,
        AssetType::Pool,
        AssetType::Storage,
        AssetType::Bandwidth,
        AssetType::ShortTermRental,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SolarRoof => "solar_roof",
            Self::Parking => "parking",
            Self::Pool => "pool",
            Self::Storage => "storage",
            Self::Bandwidth => "bandwidth",
            Self::ShortTermRental => "short_term_rental",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SolarRoof => "Rooftop solar",
            Self::Parking => "Parking space rental",
            Self::Pool => "Pool rental",
            Self::Storage => "Storage space rental",
            Self::Bandwidth => "Internet bandwidth sharing",
            Self::ShortTermRental => "Short-term rental",
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = String;

    /// Accepts the canonical names plus the aliases language models tend to emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "solar_roof" | "solar" | "rooftop_solar" | "roof" => Ok(Self::SolarRoof),
            "parking" | "parking_space" | "driveway" => Ok(Self::Parking),
            "pool" | "swimming_pool" => Ok(Self::Pool),
            "storage" | "storage_space" | "garage_storage" => Ok(Self::Storage),
            "bandwidth" | "internet" | "internet_bandwidth" => Ok(Self::Bandwidth),
            "short_term_rental" | "str" | "rental" | "vacation_rental" => {
                Ok(Self::ShortTermRental)
            }
            _ => Err(format!("Invalid asset type: {}", s)),
        }
    }
}

/// Lifecycle of an asset the owner chose to pursue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStatus {
    Selected,
    InProgress,
    Active,
    Paused,
    Declined,
}

impl SelectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::InProgress => "in_progress",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Declined => "declined",
        }
    }

    /// Whether the selection counts toward the owner's committed revenue.
    pub fn counts_toward_revenue(&self) -> bool {
        !matches!(self, Self::Declined)
    }
}

impl std::fmt::Display for SelectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selected" => Ok(Self::Selected),
            "in_progress" => Ok(Self::InProgress),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "declined" => Ok(Self::Declined),
            _ => Err(format!("Invalid selection status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Openai,
    Mock,
}

impl AnalysisSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for AnalysisSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::Openai),
            "mock" => Ok(Self::Mock),
            _ => Err(format!("Invalid analysis source: {}", s)),
        }
    }
}

/// Onboarding steps in the order an owner normally completes them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStep {
    AddressEntered,
    AnalysisViewed,
    AssetsSelected,
    PartnerConnected,
    OnboardingCompleted,
}

impl JourneyStep {
    pub const ALL: [JourneyStep; 5] = [
        JourneyStep::AddressEntered,
        JourneyStep::AnalysisViewed,
        JourneyStep::AssetsSelected,
        JourneyStep::PartnerConnected,
        JourneyStep::OnboardingCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddressEntered => "address_entered",
            Self::AnalysisViewed => "analysis_viewed",
            Self::AssetsSelected => "assets_selected",
            Self::PartnerConnected => "partner_connected",
            Self::OnboardingCompleted => "onboarding_completed",
        }
    }
}

impl std::fmt::Display for JourneyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JourneyStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address_entered" => Ok(Self::AddressEntered),
            "analysis_viewed" => Ok(Self::AnalysisViewed),
            "assets_selected" => Ok(Self::AssetsSelected),
            "partner_connected" => Ok(Self::PartnerConnected),
            "onboarding_completed" => Ok(Self::OnboardingCompleted),
            _ => Err(format!("Invalid journey step: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Invalid chat role: {}", s)),
        }
    }
}

/// Where a chat reply came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Assistant,
    Local,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Local => "local",
        }
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assistant" => Ok(Self::Assistant),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid chat mode: {}", s)),
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: String,
}

/// Result of geocoding free-form address text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeocodedAddress {
    pub formatted_address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

impl GeocodedAddress {
    /// An address we could not geocode: the user's text, no coordinates.
    pub fn ungeocoded(text: &str) -> Self {
        Self {
            formatted_address: text.to_string(),
            ..Default::default()
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub user_id: i64,
    #[serde(flatten)]
    pub location: GeocodedAddress,
    pub is_primary: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// One monetizable asset inside an analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetOpportunity {
    pub asset_type: AssetType,
    pub available: bool,
    pub monthly_revenue: f64,
    pub confidence: f64,
    /// Usable area in square feet (roof, storage) when applicable.
    pub area_sqft: Option<f64>,
    /// Count of units (parking spaces) when applicable.
    pub units: Option<u32>,
    pub notes: String,
}

/// The stored JSON result of running an address through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyReport {
    pub property_type: String,
    pub summary: String,
    pub opportunities: Vec<AssetOpportunity>,
    pub total_monthly_revenue: f64,
    pub source: AnalysisSource,
    pub model: Option<String>,
    pub satellite_image_url: Option<String>,
}

impl PropertyReport {
    pub fn opportunity(&self, asset: AssetType) -> Option<&AssetOpportunity> {
        self.opportunities.iter().find(|o| o.asset_type == asset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyAnalysis {
    pub id: i64,
    pub address_id: i64,
    pub user_id: i64,
    #[serde(flatten)]
    pub report: PropertyReport,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSelection {
    pub id: i64,
    pub analysis_id: i64,
    pub user_id: i64,
    pub asset_type: AssetType,
    pub monthly_revenue: f64,
    pub status: SelectionStatus,
    pub provider_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceProvider {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub asset_type: AssetType,
    pub description: String,
    pub signup_url: String,
    pub earnings_low: f64,
    pub earnings_high: f64,
    pub priority: i32,
    pub is_active: bool,
    pub updated_at: String,
}

/// Catalog entry for a partner, before it has a row id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewProvider {
    pub slug: String,
    pub name: String,
    pub asset_type: AssetType,
    pub description: String,
    pub signup_url: String,
    pub earnings_low: f64,
    pub earnings_high: f64,
    pub priority: i32,
}

/// What `upsert_provider` did with a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerClick {
    pub id: i64,
    pub user_id: i64,
    pub provider_id: i64,
    pub referral_url: String,
    pub clicked_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyEntry {
    pub step: JourneyStep,
    pub metadata: Option<serde_json::Value>,
    pub completed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: i64,
    pub user_id: i64,
    pub remote_thread_id: Option<String>,
    pub mode: ChatMode,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub thread_id: i64,
    pub role: ChatRole,
    pub content: String,
    pub created_at: String,
}

// ── API view types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub user: User,
    pub primary_address: Option<Address>,
    pub latest_analysis: Option<PropertyAnalysis>,
    pub selections: Vec<AssetSelection>,
    /// Sum of the latest analysis line items.
    pub potential_monthly_revenue: f64,
    /// Sum of selections that are not declined.
    pub selected_monthly_revenue: f64,
    pub journey: JourneyProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JourneyProgress {
    pub completed: Vec<JourneyStep>,
    pub next_step: Option<JourneyStep>,
    pub percent_complete: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickStats {
    pub provider_id: i64,
    pub slug: String,
    pub name: String,
    pub clicks: i64,
    pub unique_users: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deactivated: usize,
}
