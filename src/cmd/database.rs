//! Database maintenance commands: `propyield init-db` and `propyield sync-partners`.

use anyhow::{Context, Result};

use propyield::config::AppConfig;
use propyield::monetize::db::PropyieldDb;
use propyield::monetize::partners;

pub fn cmd_init_db(config: &AppConfig) -> Result<()> {
    let db_path = config.db_path();
    PropyieldDb::new(&db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}

pub fn cmd_sync_partners(config: &AppConfig) -> Result<()> {
    let db = PropyieldDb::new(&config.db_path())?;
    let report = partners::sync_partners(&db)?;

    println!("Partner catalog synced:");
    println!("  inserted    {}", report.inserted);
    println!("  updated     {}", report.updated);
    println!("  unchanged   {}", report.unchanged);
    println!("  deactivated {}", report.deactivated);
    Ok(())
}
