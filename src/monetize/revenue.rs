//! Revenue bounds and estimate formulas.
//!
//! Model output is never trusted as-is: every opportunity passes through
//! [`clamp_opportunity`] before it is stored, and report totals are always
//! recomputed from the line items with [`total_monthly`].

use super::models::{AssetOpportunity, AssetType};

/// Sanity bounds for one asset type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetBounds {
    pub max_monthly: f64,
    pub max_area_sqft: Option<f64>,
    pub max_units: Option<u32>,
}

pub fn bounds(asset: AssetType) -> AssetBounds {
    match asset {
        AssetType::SolarRoof => AssetBounds {
            max_monthly: 500.0,
            max_area_sqft: Some(10_000.0),
            max_units: None,
        },
        AssetType::Parking => AssetBounds {
            max_monthly: 1_500.0,
            max_area_sqft: None,
            max_units: Some(10),
        },
        AssetType::Pool => AssetBounds {
            max_monthly: 3_000.0,
            max_area_sqft: Some(2_000.0),
            max_units: None,
        },
        AssetType::Storage => AssetBounds {
            max_monthly: 800.0,
            max_area_sqft: Some(2_000.0),
            max_units: None,
        },
        AssetType::Bandwidth => AssetBounds {
            max_monthly: 50.0,
            max_area_sqft: None,
            max_units: None,
        },
        AssetType::ShortTermRental => AssetBounds {
            max_monthly: 8_000.0,
            max_area_sqft: Some(10_000.0),
            max_units: None,
        },
    }
}

/// Inputs for the simple estimate formulas. Fields irrelevant to an asset
/// are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AssetMetrics {
    pub area_sqft: f64,
    pub units: u32,
    /// Dollar rate: per sqft-month, per space-day, per pool-hour or per night.
    pub rate: f64,
    /// Occupied days, rented hours or booked nights per month.
    pub utilization: f64,
}

/// Share of a roof that can carry panels after setbacks and vents.
pub const SOLAR_USABLE_RATIO: f64 = 0.6;
/// Flat monthly payout of bandwidth-sharing apps for one household line.
pub const BANDWIDTH_MONTHLY: f64 = 25.0;

/// Estimate monthly revenue from metrics, already clamped to the asset bounds.
pub fn estimate_monthly(asset: AssetType, m: &AssetMetrics) -> f64 {
    let raw = match asset {
        AssetType::SolarRoof => m.area_sqft * SOLAR_USABLE_RATIO * m.rate,
        AssetType::Parking => m.units as f64 * m.rate * m.utilization,
        AssetType::Pool => m.rate * m.utilization,
        AssetType::Storage => m.area_sqft * m.rate,
        AssetType::Bandwidth => BANDWIDTH_MONTHLY,
        AssetType::ShortTermRental => m.rate * m.utilization,
    };
    clamp_revenue(asset, raw)
}

fn finite_non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

pub fn clamp_revenue(asset: AssetType, value: f64) -> f64 {
    round_cents(finite_non_negative(value).min(bounds(asset).max_monthly))
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Apply the bounds for the opportunity's asset type. Unavailable assets
/// earn nothing.
pub fn clamp_opportunity(mut opp: AssetOpportunity) -> AssetOpportunity {
    let b = bounds(opp.asset_type);
    opp.monthly_revenue = if opp.available {
        clamp_revenue(opp.asset_type, opp.monthly_revenue)
    } else {
        0.0
    };
    opp.confidence = clamp_confidence(opp.confidence);
    opp.area_sqft = match (opp.area_sqft, b.max_area_sqft) {
        (Some(area), Some(max)) => Some(finite_non_negative(area).min(max).round()),
        _ => None,
    };
    opp.units = match (opp.units, b.max_units) {
        (Some(units), Some(max)) => Some(units.min(max)),
        _ => None,
    };
    opp
}

/// Sum of the available line items, rounded to cents.
pub fn total_monthly(opportunities: &[AssetOpportunity]) -> f64 {
    round_cents(
        opportunities
            .iter()
            .filter(|o| o.available)
            .map(|o| o.monthly_revenue)
            .sum(),
    )
}
