//! Local analysis generator used when the language model is unavailable.
//!
//! Output is deterministic per address: metrics are drawn from a SHA-256 of
//! the normalized address text, so the same property always gets the same
//! numbers across restarts.

use sha2::{Digest, Sha256};

use super::models::{AnalysisSource, AssetOpportunity, AssetType, PropertyReport};
use super::revenue::{self, AssetMetrics};

pub const MOCK_MODEL: &str = "mock-v1";

/// Deterministic stream of unit floats derived from a digest.
struct Seed {
    bytes: [u8; 32],
    cursor: usize,
}

impl Seed {
    fn from_address(address: &str) -> Self {
        let normalized = address
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self { bytes, cursor: 0 }
    }

    /// Next value in `[0, 1)`.
    fn next_unit(&mut self) -> f64 {
        let hi = self.bytes[self.cursor % 32] as u16;
        let lo = self.bytes[(self.cursor + 1) % 32] as u16;
        self.cursor += 2;
        ((hi << 8) | lo) as f64 / 65_536.0
    }

    fn range(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_unit()
    }

    fn chance(&mut self, probability: f64) -> bool {
        self.next_unit() < probability
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MockAnalysisGenerator;

impl MockAnalysisGenerator {
    pub fn generate(&self, formatted_address: &str) -> PropertyReport {
        let mut seed = Seed::from_address(formatted_address);

        let property_type = if seed.chance(0.7) {
            "single_family"
        } else {
            "townhouse"
        };
        let detached = property_type == "single_family";

        let roof_sqft = seed.range(900.0, 2_600.0).round();
        let solar = AssetMetrics {
            area_sqft: roof_sqft,
            rate: seed.range(0.08, 0.18),
            ..Default::default()
        };

        let spaces = if detached { 1 + (seed.next_unit() * 2.0) as u32 } else { 1 };
        let parking = AssetMetrics {
            units: spaces,
            rate: seed.range(8.0, 25.0),
            utilization: seed.range(10.0, 22.0),
            ..Default::default()
        };

        let has_pool = detached && seed.chance(0.35);
        let pool = AssetMetrics {
            rate: seed.range(35.0, 75.0),
            utilization: seed.range(8.0, 30.0),
            ..Default::default()
        };

        let storage_sqft = seed.range(80.0, 300.0).round();
        let storage = AssetMetrics {
            area_sqft: storage_sqft,
            rate: seed.range(0.6, 1.4),
            ..Default::default()
        };

        let rental = AssetMetrics {
            rate: seed.range(90.0, 220.0),
            utilization: seed.range(4.0, 12.0),
            ..Default::default()
        };

        let opportunities: Vec<AssetOpportunity> = vec![
            opportunity(
                AssetType::SolarRoof,
                true,
                revenue::estimate_monthly(AssetType::SolarRoof, &solar),
                0.6,
                Some(roof_sqft),
                None,
                "Estimated from typical roof size for the area; a site survey refines this.",
            ),
            opportunity(
                AssetType::Parking,
                true,
                revenue::estimate_monthly(AssetType::Parking, &parking),
                0.55,
                None,
                Some(spaces),
                "Driveway spaces rented to commuters and event visitors.",
            ),
            opportunity(
                AssetType::Pool,
                has_pool,
                revenue::estimate_monthly(AssetType::Pool, &pool),
                if has_pool { 0.5 } else { 0.2 },
                None,
                None,
                if has_pool {
                    "Hourly pool rentals during the warm season."
                } else {
                    "No pool detected."
                },
            ),
            opportunity(
                AssetType::Storage,
                true,
                revenue::estimate_monthly(AssetType::Storage, &storage),
                0.5,
                Some(storage_sqft),
                None,
                "Garage or basement space rented for storage.",
            ),
            opportunity(
                AssetType::Bandwidth,
                true,
                revenue::estimate_monthly(AssetType::Bandwidth, &AssetMetrics::default()),
                0.8,
                None,
                None,
                "Passive income from sharing unused internet bandwidth.",
            ),
            opportunity(
                AssetType::ShortTermRental,
                detached,
                revenue::estimate_monthly(AssetType::ShortTermRental, &rental),
                0.4,
                None,
                None,
                "Occasional nightly rentals of a spare room or the whole home.",
            ),
        ]
        .into_iter()
        .map(revenue::clamp_opportunity)
        .collect();

        let total_monthly_revenue = revenue::total_monthly(&opportunities);

        PropertyReport {
            property_type: property_type.to_string(),
            summary: format!(
                "Estimated earning potential for {} based on typical properties nearby.",
                formatted_address
            ),
            opportunities,
            total_monthly_revenue,
            source: AnalysisSource::Mock,
            model: Some(MOCK_MODEL.to_string()),
            satellite_image_url: None,
        }
    }
}

fn opportunity(
    asset_type: AssetType,
    available: bool,
    monthly_revenue: f64,
    confidence: f64,
    area_sqft: Option<f64>,
    units: Option<u32>,
    notes: &str,
) -> AssetOpportunity {
    AssetOpportunity {
        asset_type,
        available,
        monthly_revenue,
        confidence,
        area_sqft,
        units,
        notes: notes.to_string(),
    }
}
