//! Property analysis pipeline.
//!
//! ```text
//! address text ─> validate ─> geocode ─> satellite image ─> prompt ─> LLM
//!                                                                      │
//!            PropertyReport <── totals <── clamp <── parse JSON <──────┘
//! ```
//!
//! The mock generator replaces the model when it is not configured, when
//! `force_mock` is set, or when the provider reports exhausted quota.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use super::geocode::{self, Geocoder};
use super::llm::{CompletionRequest, LlmClient};
use super::mock::MockAnalysisGenerator;
use super::models::{AnalysisSource, AssetOpportunity, AssetType, GeocodedAddress, PropertyReport};
use super::revenue;
use super::validation::validate_address_input;
use crate::config::{AnalysisSection, MapsSection};
use crate::errors::{AnalysisError, GeocodeError};

const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a property monetization analyst. Given a residential address (and, when provided, an overhead satellite image of the parcel), estimate which assets the owner could rent out or monetize.

You MUST respond with a single JSON object matching this schema:
{
  "property_type": "single_family" | "townhouse" | "condo" | "multi_family" | "commercial" | "land",
  "summary": "Two sentences describing the property and its best opportunities",
  "assets": [
    {
      "type": "solar_roof" | "parking" | "pool" | "storage" | "bandwidth" | "short_term_rental",
      "available": true,
      "monthly_revenue": 0,
      "confidence": 0.0,
      "area_sqft": null,
      "units": null,
      "notes": "One sentence on how the estimate was reached"
    }
  ]
}

Rules:
- Include every asset type exactly once, marking assets the property lacks as "available": false.
- monthly_revenue is net US dollars per month for a typical owner in this market.
- confidence is between 0 and 1.
- area_sqft is the usable roof area for solar_roof and the usable space for storage; units is the number of parking spaces.
- Be conservative: prefer under- to over-estimating.
"#;

/// Raw asset entry as the model returns it. Every field is optional because
/// model output is not trusted to follow the schema.
#[derive(Debug, Deserialize)]
struct RawAsset {
    #[serde(rename = "type", alias = "asset_type")]
    asset_type: String,
    #[serde(default = "default_available")]
    available: bool,
    #[serde(default, deserialize_with = "lenient_f64")]
    monthly_revenue: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    area_sqft: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    units: Option<f64>,
    #[serde(default)]
    notes: Option<String>,
}

fn default_available() -> bool {
    true
}

/// Accept numbers, numeric strings ("$1,200") and null.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect::<String>()
            .parse()
            .ok(),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    property_type: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "opportunities")]
    assets: Vec<RawAsset>,
}

/// Parse a model response into clamped opportunities.
///
/// Tolerates markdown code fences and prose around the object by taking the
/// outermost `{ .. }`. Unknown asset types are dropped; duplicates keep the
/// first entry.
pub fn parse_analysis_response(text: &str) -> Result<(String, String, Vec<AssetOpportunity>), AnalysisError> {
    let cleaned = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => {
            return Err(AnalysisError::InvalidResponse(
                "response contains no JSON object".to_string(),
            ));
        }
    };
    let raw: RawAnalysis = serde_json::from_str(cleaned)
        .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;

    let mut opportunities: Vec<AssetOpportunity> = Vec::new();
    for asset in raw.assets {
        let asset_type = match AssetType::from_str(&asset.asset_type) {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!(asset_type = %asset.asset_type, "Dropping unknown asset type from analysis");
                continue;
            }
        };
        if opportunities.iter().any(|o| o.asset_type == asset_type) {
            continue;
        }
        opportunities.push(revenue::clamp_opportunity(AssetOpportunity {
            asset_type,
            available: asset.available,
            monthly_revenue: asset.monthly_revenue.unwrap_or(0.0),
            confidence: asset.confidence.unwrap_or(0.5),
            area_sqft: asset.area_sqft,
            units: asset.units.filter(|u| u.is_finite() && *u >= 0.0).map(|u| u.round() as u32),
            notes: asset.notes.unwrap_or_default(),
        }));
    }

    if opportunities.is_empty() {
        return Err(AnalysisError::InvalidResponse(
            "response lists no recognizable assets".to_string(),
        ));
    }

    // Stable display order regardless of model ordering.
    opportunities.sort_by_key(|o| AssetType::ALL.iter().position(|a| *a == o.asset_type));

    Ok((
        raw.property_type
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        raw.summary.unwrap_or_default(),
        opportunities,
    ))
}

pub fn build_user_prompt(address: &GeocodedAddress, has_image: bool) -> String {
    let mut prompt = format!("Analyze this property.\n\nAddress: {}\n", address.formatted_address);
    if let Some((lat, lng)) = address.coordinates() {
        prompt.push_str(&format!("Coordinates: {:.6}, {:.6}\n", lat, lng));
    }
    if has_image {
        prompt.push_str("An overhead satellite image of the parcel is attached.\n");
    }
    prompt.push_str("\nRespond with JSON only.");
    prompt
}

/// Result of running an address through the pipeline.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub address: GeocodedAddress,
    pub report: PropertyReport,
}

/// Sequential orchestrator over the geocoder, the image fetch and the model.
pub struct AnalysisService {
    geocoder: Option<Arc<dyn Geocoder>>,
    llm: Option<Arc<dyn LlmClient>>,
    maps: MapsSection,
    maps_api_key: Option<String>,
    settings: AnalysisSection,
    http: reqwest::Client,
    mock: MockAnalysisGenerator,
}

impl AnalysisService {
    pub fn new(
        geocoder: Option<Arc<dyn Geocoder>>,
        llm: Option<Arc<dyn LlmClient>>,
        maps: MapsSection,
        maps_api_key: Option<String>,
        settings: AnalysisSection,
    ) -> Self {
        Self {
            geocoder,
            llm,
            maps,
            maps_api_key,
            settings,
            http: reqwest::Client::new(),
            mock: MockAnalysisGenerator,
        }
    }

    /// A service with no external providers: every analysis is mocked.
    pub fn offline() -> Self {
        Self::new(
            None,
            None,
            MapsSection::default(),
            None,
            AnalysisSection::default(),
        )
    }

    pub async fn analyze(&self, address_text: &str) -> Result<AnalysisOutcome, AnalysisError> {
        let input = validate_address_input(address_text)?;
        let address = self.resolve_address(&input).await?;

        let llm = match &self.llm {
            Some(llm) if !self.settings.force_mock => llm,
            _ => {
                tracing::info!(address = %address.formatted_address, "Using mock analysis (no language model configured)");
                return Ok(self.mock_outcome(address));
            }
        };

        let satellite_url = match (address.coordinates(), &self.maps_api_key) {
            (Some((lat, lng)), Some(key)) => {
                match geocode::satellite_image_url(lat, lng, &self.maps, key) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not build satellite image URL");
                        None
                    }
                }
            }
            _ => None,
        };
        let image = match (&satellite_url, self.settings.use_satellite_image) {
            (Some(url), true) => match geocode::fetch_satellite_image(&self.http, url).await {
                Ok(data_url) => Some(data_url),
                Err(e) => {
                    tracing::warn!(error = %e, "Satellite image fetch failed, continuing text-only");
                    None
                }
            },
            _ => None,
        };

        let request = CompletionRequest {
            system: ANALYSIS_SYSTEM_PROMPT.to_string(),
            user: build_user_prompt(&address, image.is_some()),
            image_url: image,
            json_output: true,
        };

        let response = match llm.complete(request).await {
            Ok(response) => response,
            Err(e) if e.is_quota() => {
                tracing::warn!(error = %e, "Language model quota exceeded, falling back to mock analysis");
                return Ok(self.mock_outcome(address));
            }
            Err(e) => return Err(e.into()),
        };

        let (property_type, summary, opportunities) = parse_analysis_response(&response)?;
        let total_monthly_revenue = revenue::total_monthly(&opportunities);
        tracing::info!(
            address = %address.formatted_address,
            total_monthly_revenue,
            assets = opportunities.len(),
            "Property analysis completed"
        );

        Ok(AnalysisOutcome {
            report: PropertyReport {
                property_type,
                summary,
                opportunities,
                total_monthly_revenue,
                source: AnalysisSource::Openai,
                model: Some(llm.model().to_string()),
                satellite_image_url: satellite_url.as_deref().map(geocode::redact_key),
            },
            address,
        })
    }

    /// Validate and geocode an address without analysing it.
    pub async fn resolve(&self, address_text: &str) -> Result<GeocodedAddress, AnalysisError> {
        let input = validate_address_input(address_text)?;
        self.resolve_address(&input).await
    }

    async fn resolve_address(&self, input: &str) -> Result<GeocodedAddress, AnalysisError> {
        let Some(geocoder) = &self.geocoder else {
            return Ok(GeocodedAddress::ungeocoded(input));
        };
        match geocoder.geocode(input).await {
            Ok(address) => Ok(address),
            Err(GeocodeError::QuotaExceeded) => {
                tracing::warn!("Geocoding quota exceeded, continuing without coordinates");
                Ok(GeocodedAddress::ungeocoded(input))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mock_outcome(&self, address: GeocodedAddress) -> AnalysisOutcome {
        let report = self.mock.generate(&address.formatted_address);
        AnalysisOutcome { address, report }
    }
}
