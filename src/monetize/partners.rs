//! Partner catalog and reconciliation into `service_providers`.

use anyhow::{Context, Result};

use super::db::PropyieldDb;
use super::models::{AssetType, NewProvider, ServiceProvider, SyncReport, UpsertOutcome};

pub const UTM_SOURCE: &str = "propyield";

fn entry(
    slug: &str,
    name: &str,
    asset_type: AssetType,
    description: &str,
    signup_url: &str,
    earnings: (f64, f64),
    priority: i32,
) -> NewProvider {
    NewProvider {
        slug: slug.to_string(),
        name: name.to_string(),
        asset_type,
        description: description.to_string(),
        signup_url: signup_url.to_string(),
        earnings_low: earnings.0,
        earnings_high: earnings.1,
        priority,
    }
}

/// Partners the app refers owners to. `sync_partners` makes the database
/// match this list.
pub fn partner_catalog() -> Vec<NewProvider> {
    vec![
        entry(
            "swimply",
            "Swimply",
            AssetType::Pool,
            "Rent your pool by the hour to local swimmers.",
            "https://swimply.com/host",
            (200.0, 3_000.0),
            1,
        ),
        entry(
            "spothero",
            "SpotHero",
            AssetType::Parking,
            "List your driveway or garage spot for commuters and events.",
            "https://spothero.com/partners",
            (50.0, 600.0),
            1,
        ),
        entry(
            "neighbor-parking",
            "Neighbor (parking)",
            AssetType::Parking,
            "Rent long-term parking for cars, boats and RVs.",
            "https://www.neighbor.com/host",
            (40.0, 400.0),
            2,
        ),
        entry(
            "neighbor-storage",
            "Neighbor (storage)",
            AssetType::Storage,
            "Rent unused garage, basement or closet space as storage.",
            "https://www.neighbor.com/host",
            (50.0, 500.0),
            1,
        ),
        entry(
            "honeygain",
            "Honeygain",
            AssetType::Bandwidth,
            "Earn passively by sharing unused internet bandwidth.",
            "https://www.honeygain.com/",
            (5.0, 20.0),
            1,
        ),
        entry(
            "packetstream",
            "PacketStream",
            AssetType::Bandwidth,
            "Peer-to-peer bandwidth sharing that pays per gigabyte.",
            "https://packetstream.io/",
            (3.0, 15.0),
            2,
        ),
        entry(
            "airbnb",
            "Airbnb",
            AssetType::ShortTermRental,
            "Host a spare room or the whole home for short stays.",
            "https://www.airbnb.com/host/homes",
            (500.0, 5_000.0),
            1,
        ),
        entry(
            "peerspace",
            "Peerspace",
            AssetType::ShortTermRental,
            "Rent your space by the hour for photo shoots, meetings and events.",
            "https://www.peerspace.com/host",
            (200.0, 2_000.0),
            2,
        ),
        entry(
            "sunrun",
            "Sunrun",
            AssetType::SolarRoof,
            "Residential solar with lease and purchase options.",
            "https://www.sunrun.com/",
            (50.0, 250.0),
            1,
        ),
    ]
}

/// Reconcile the catalog into the database: upsert every entry by slug and
/// deactivate active rows whose slug left the catalog. Running it twice in a
/// row reports everything unchanged the second time.
pub fn sync_partners(db: &PropyieldDb) -> Result<SyncReport> {
    let catalog = partner_catalog();
    let mut report = SyncReport::default();

    for provider in &catalog {
        match db
            .upsert_provider(provider)
            .with_context(|| format!("Failed to sync partner '{}'", provider.slug))?
        {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
    }

    let slugs: Vec<String> = catalog.into_iter().map(|p| p.slug).collect();
    report.deactivated = db.deactivate_providers_except(&slugs)?;

    db.set_setting("partners.last_sync", &chrono::Utc::now().to_rfc3339())?;
    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        deactivated = report.deactivated,
        "Partner catalog synced"
    );
    Ok(report)
}

/// Signup link carrying the referral code and attribution parameters.
pub fn referral_url(provider: &ServiceProvider, referral_code: &str, user_id: i64) -> Result<String> {
    let mut url = reqwest::Url::parse(&provider.signup_url)
        .with_context(|| format!("Invalid signup URL for '{}'", provider.slug))?;
    url.query_pairs_mut()
        .append_pair("ref", &format!("{}-{}", referral_code, user_id))
        .append_pair("utm_source", UTM_SOURCE)
        .append_pair("utm_medium", "referral")
        .append_pair("utm_campaign", provider.asset_type.as_str());
    Ok(url.to_string())
}

/// Active providers for an asset, best first.
pub fn recommend(db: &PropyieldDb, asset_type: AssetType) -> Result<Vec<ServiceProvider>> {
    db.list_providers(Some(asset_type), false)
}
