//! One-off property analysis: `propyield analyze <ADDRESS>`.

use anyhow::Result;

use propyield::config::AppConfig;
use propyield::monetize::server::analysis_service;

pub async fn cmd_analyze(config: &AppConfig, address: &str, json: bool) -> Result<()> {
    let service = analysis_service(&config.toml)?;
    let outcome = service.analyze(address).await?;
    let report = &outcome.report;

    if json {
        let value = serde_json::json!({
            "address": outcome.address,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{}", outcome.address.formatted_address);
    if let Some((lat, lng)) = outcome.address.coordinates() {
        println!("  ({:.5}, {:.5})", lat, lng);
    }
    println!();
    println!("Property type: {}", report.property_type);
    match &report.model {
        Some(model) => println!("Source:        {} ({})", report.source.as_str(), model),
        None => println!("Source:        {}", report.source.as_str()),
    }
    println!();
    println!(
        "  {:<20} {:>9} {:>12} {:>10}",
        "Asset", "Available", "Monthly", "Confidence"
    );
    for o in &report.opportunities {
        println!(
            "  {:<20} {:>9} {:>12} {:>9.0}%",
            o.asset_type.label(),
            if o.available { "yes" } else { "no" },
            format!("${:.2}", o.monthly_revenue),
            o.confidence * 100.0
        );
    }
    println!();
    println!("Total: ${:.2}/month", report.total_monthly_revenue);
    if !report.summary.is_empty() {
        println!();
        println!("{}", report.summary);
    }
    println!();
    Ok(())
}
