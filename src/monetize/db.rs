use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use super::revenue;

/// Async-safe handle to the application database.
///
/// Wraps `PropyieldDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PropyieldDb>>,
}

impl DbHandle {
    pub fn new(db: PropyieldDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PropyieldDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PropyieldDb {
    conn: Connection,
}

const ADDRESS_COLUMNS: &str = "id, user_id, formatted_address, latitude, longitude, street, city, \
     state, postal_code, is_primary, created_at, updated_at";

const ANALYSIS_COLUMNS: &str = "id, address_id, user_id, property_type, summary, opportunities, \
     total_monthly_revenue, source, model, satellite_image_url, created_at";

const SELECTION_COLUMNS: &str = "id, analysis_id, user_id, asset_type, monthly_revenue, status, \
     provider_id, created_at, updated_at";

const PROVIDER_COLUMNS: &str = "id, slug, name, asset_type, description, signup_url, \
     earnings_low, earnings_high, priority, is_active, updated_at";

impl PropyieldDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    display_name TEXT,
                    token_hash TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS addresses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    formatted_address TEXT NOT NULL,
                    latitude REAL,
                    longitude REAL,
                    street TEXT,
                    city TEXT,
                    state TEXT,
                    postal_code TEXT,
                    is_primary INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_addresses_one_primary
                    ON addresses(user_id) WHERE is_primary = 1;

                CREATE TABLE IF NOT EXISTS property_analyses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    address_id INTEGER NOT NULL REFERENCES addresses(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    property_type TEXT NOT NULL DEFAULT 'unknown',
                    summary TEXT NOT NULL DEFAULT '',
                    opportunities TEXT NOT NULL DEFAULT '[]',
                    total_monthly_revenue REAL NOT NULL DEFAULT 0,
                    source TEXT NOT NULL,
                    model TEXT,
                    satellite_image_url TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS service_providers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slug TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    asset_type TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    signup_url TEXT NOT NULL,
                    earnings_low REAL NOT NULL DEFAULT 0,
                    earnings_high REAL NOT NULL DEFAULT 0,
                    priority INTEGER NOT NULL DEFAULT 100,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS asset_selections (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    analysis_id INTEGER NOT NULL REFERENCES property_analyses(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    asset_type TEXT NOT NULL,
                    monthly_revenue REAL NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'selected',
                    provider_id INTEGER REFERENCES service_providers(id) ON DELETE SET NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(analysis_id, asset_type)
                );

                CREATE TABLE IF NOT EXISTS partner_clicks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    provider_id INTEGER NOT NULL REFERENCES service_providers(id) ON DELETE CASCADE,
                    referral_url TEXT NOT NULL,
                    clicked_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS journey_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    step TEXT NOT NULL,
                    metadata TEXT,
                    completed_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(user_id, step)
                );

                CREATE TABLE IF NOT EXISTS chat_threads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    remote_thread_id TEXT,
                    mode TEXT NOT NULL DEFAULT 'local',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS chat_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id INTEGER NOT NULL REFERENCES chat_threads(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_addresses_user ON addresses(user_id);
                CREATE INDEX IF NOT EXISTS idx_analyses_address ON property_analyses(address_id);
                CREATE INDEX IF NOT EXISTS idx_analyses_user ON property_analyses(user_id);
                CREATE INDEX IF NOT EXISTS idx_selections_analysis ON asset_selections(analysis_id);
                CREATE INDEX IF NOT EXISTS idx_providers_asset ON service_providers(asset_type, priority);
                CREATE INDEX IF NOT EXISTS idx_clicks_provider ON partner_clicks(provider_id);
                CREATE INDEX IF NOT EXISTS idx_chat_messages_thread ON chat_messages(thread_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
        token_hash: &str,
    ) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (email, display_name, token_hash) VALUES (?1, ?2, ?3)",
                params![email, display_name, token_hash],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, display_name, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, display_name, created_at FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by email")
    }

    pub fn find_user_by_token_hash(&self, token_hash: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, display_name, created_at FROM users WHERE token_hash = ?1",
                params![token_hash],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by token")
    }

    // ── Addresses ─────────────────────────────────────────────────────

    /// Save an address for a user. The first address a user saves always
    /// becomes primary; later ones only when `make_primary` is set.
    pub fn create_address(
        &self,
        user_id: i64,
        location: &GeocodedAddress,
        make_primary: bool,
    ) -> Result<Address> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin address transaction")?;
        let id = insert_address(&tx, user_id, location, make_primary)?;
        tx.commit().context("Failed to commit address")?;

        self.get_address(id)?.context("Address not found after insert")
    }

    pub fn list_addresses(&self, user_id: i64) -> Result<Vec<Address>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ADDRESS_COLUMNS} FROM addresses WHERE user_id = ?1
                 ORDER BY is_primary DESC, id"
            ))
            .context("Failed to prepare list_addresses")?;
        let rows = stmt
            .query_map(params![user_id], address_from_row)
            .context("Failed to query addresses")?;
        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row.context("Failed to read address row")?);
        }
        Ok(addresses)
    }

    pub fn get_address(&self, id: i64) -> Result<Option<Address>> {
        self.conn
            .query_row(
                &format!("SELECT {ADDRESS_COLUMNS} FROM addresses WHERE id = ?1"),
                params![id],
                address_from_row,
            )
            .optional()
            .context("Failed to query address")
    }

    pub fn primary_address(&self, user_id: i64) -> Result<Option<Address>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ADDRESS_COLUMNS} FROM addresses WHERE user_id = ?1 AND is_primary = 1"
                ),
                params![user_id],
                address_from_row,
            )
            .optional()
            .context("Failed to query primary address")
    }

    /// Make `address_id` the user's primary address. Demote and promote run in
    /// one transaction so the one-primary index never sees two rows.
    pub fn set_primary_address(&self, user_id: i64, address_id: i64) -> Result<Address> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin primary transaction")?;

        let owner: Option<i64> = tx
            .query_row(
                "SELECT user_id FROM addresses WHERE id = ?1",
                params![address_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up address owner")?;
        if owner != Some(user_id) {
            anyhow::bail!("Address {} not found for user {}", address_id, user_id);
        }

        tx.execute(
            "UPDATE addresses SET is_primary = 0, updated_at = datetime('now')
             WHERE user_id = ?1 AND is_primary = 1 AND id != ?2",
            params![user_id, address_id],
        )
        .context("Failed to demote primary address")?;
        tx.execute(
            "UPDATE addresses SET is_primary = 1, updated_at = datetime('now') WHERE id = ?1",
            params![address_id],
        )
        .context("Failed to promote primary address")?;
        tx.commit().context("Failed to commit primary change")?;

        self.get_address(address_id)?
            .context("Address not found after primary change")
    }

    /// Delete an address (its analyses cascade). If it was primary, the
    /// user's oldest remaining address is promoted.
    pub fn delete_address(&self, id: i64) -> Result<bool> {
        let Some(address) = self.get_address(id)? else {
            return Ok(false);
        };
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin delete transaction")?;
        tx.execute("DELETE FROM addresses WHERE id = ?1", params![id])
            .context("Failed to delete address")?;
        if address.is_primary {
            tx.execute(
                "UPDATE addresses SET is_primary = 1, updated_at = datetime('now')
                 WHERE id = (SELECT MIN(id) FROM addresses WHERE user_id = ?1)",
                params![address.user_id],
            )
            .context("Failed to promote replacement primary address")?;
        }
        tx.commit().context("Failed to commit address delete")?;
        Ok(true)
    }

    // ── Analyses ──────────────────────────────────────────────────────

    /// Store a report. The stored total is recomputed from the line items.
    pub fn insert_analysis(
        &self,
        address_id: i64,
        user_id: i64,
        report: &PropertyReport,
    ) -> Result<PropertyAnalysis> {
        let opportunities = serde_json::to_string(&report.opportunities)
            .context("Failed to serialize opportunities")?;
        let total = revenue::total_monthly(&report.opportunities);
        self.conn
            .execute(
                "INSERT INTO property_analyses
                    (address_id, user_id, property_type, summary, opportunities,
                     total_monthly_revenue, source, model, satellite_image_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    address_id,
                    user_id,
                    report.property_type,
                    report.summary,
                    opportunities,
                    total,
                    report.source.as_str(),
                    report.model,
                    report.satellite_image_url,
                ],
            )
            .context("Failed to insert analysis")?;
        let id = self.conn.last_insert_rowid();
        self.get_analysis(id)?.context("Analysis not found after insert")
    }

    /// Store a finished analysis with its address and the journey steps it
    /// implies, all or nothing. `existing_address` reuses a saved address
    /// instead of creating one from `location`.
    pub fn save_analysis(
        &self,
        user_id: i64,
        existing_address: Option<i64>,
        location: &GeocodedAddress,
        report: &PropertyReport,
        make_primary: bool,
    ) -> Result<(Address, PropertyAnalysis)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin analysis transaction")?;

        let address_id = match existing_address {
            Some(id) => {
                self.get_address(id)?
                    .ok_or_else(|| anyhow::anyhow!("Address {} not found", id))?
                    .id
            }
            None => insert_address(&tx, user_id, location, make_primary)?,
        };
        let analysis = self.insert_analysis(address_id, user_id, report)?;
        self.record_journey_step(user_id, JourneyStep::AddressEntered, None)?;
        self.record_journey_step(user_id, JourneyStep::AnalysisViewed, None)?;
        tx.commit().context("Failed to commit analysis")?;

        let address = self
            .get_address(address_id)?
            .context("Address not found after saving analysis")?;
        Ok((address, analysis))
    }

    pub fn get_analysis(&self, id: i64) -> Result<Option<PropertyAnalysis>> {
        self.query_analysis(
            &format!("SELECT {ANALYSIS_COLUMNS} FROM property_analyses WHERE id = ?1"),
            id,
        )
    }

    pub fn latest_analysis_for_address(&self, address_id: i64) -> Result<Option<PropertyAnalysis>> {
        self.query_analysis(
            &format!(
                "SELECT {ANALYSIS_COLUMNS} FROM property_analyses
                 WHERE address_id = ?1 ORDER BY id DESC LIMIT 1"
            ),
            address_id,
        )
    }

    pub fn latest_analysis_for_user(&self, user_id: i64) -> Result<Option<PropertyAnalysis>> {
        self.query_analysis(
            &format!(
                "SELECT {ANALYSIS_COLUMNS} FROM property_analyses
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1"
            ),
            user_id,
        )
    }

    fn query_analysis(&self, sql: &str, id: i64) -> Result<Option<PropertyAnalysis>> {
        let row = self
            .conn
            .query_row(sql, params![id], AnalysisRow::from_row)
            .optional()
            .context("Failed to query analysis")?;
        row.map(AnalysisRow::into_analysis).transpose()
    }

    /// Most recent analyses across all users.
    pub fn list_analyses(&self, limit: i64) -> Result<Vec<PropertyAnalysis>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ANALYSIS_COLUMNS} FROM property_analyses ORDER BY id DESC LIMIT ?1"
            ))
            .context("Failed to prepare list_analyses")?;
        let rows = stmt
            .query_map(params![limit], AnalysisRow::from_row)
            .context("Failed to query analyses")?;
        let mut analyses = Vec::new();
        for row in rows {
            analyses.push(row.context("Failed to read analysis row")?.into_analysis()?);
        }
        Ok(analyses)
    }

    // ── Asset selections ──────────────────────────────────────────────

    /// Select an asset from an analysis. Re-selecting updates the revenue and
    /// revives a declined selection; other statuses are kept.
    pub fn upsert_asset_selection(
        &self,
        user_id: i64,
        analysis_id: i64,
        asset_type: AssetType,
        monthly_revenue: f64,
    ) -> Result<AssetSelection> {
        self.conn
            .execute(
                "INSERT INTO asset_selections (analysis_id, user_id, asset_type, monthly_revenue)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(analysis_id, asset_type) DO UPDATE SET
                    monthly_revenue = excluded.monthly_revenue,
                    status = CASE WHEN asset_selections.status = 'declined'
                                  THEN 'selected' ELSE asset_selections.status END,
                    updated_at = datetime('now')",
                params![
                    analysis_id,
                    user_id,
                    asset_type.as_str(),
                    revenue::clamp_revenue(asset_type, monthly_revenue)
                ],
            )
            .context("Failed to upsert asset selection")?;

        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SELECTION_COLUMNS} FROM asset_selections
                     WHERE analysis_id = ?1 AND asset_type = ?2"
                ),
                params![analysis_id, asset_type.as_str()],
                SelectionRow::from_row,
            )
            .context("Asset selection not found after upsert")?;
        row.into_selection()
    }

    pub fn get_selection(&self, id: i64) -> Result<Option<AssetSelection>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SELECTION_COLUMNS} FROM asset_selections WHERE id = ?1"),
                params![id],
                SelectionRow::from_row,
            )
            .optional()
            .context("Failed to query asset selection")?;
        row.map(SelectionRow::into_selection).transpose()
    }

    pub fn update_selection_status(
        &self,
        id: i64,
        status: SelectionStatus,
    ) -> Result<AssetSelection> {
        let changed = self
            .conn
            .execute(
                "UPDATE asset_selections SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update selection status")?;
        if changed == 0 {
            anyhow::bail!("Asset selection {} not found", id);
        }
        self.get_selection(id)?
            .context("Asset selection not found after status update")
    }

    pub fn set_selection_provider(
        &self,
        id: i64,
        provider_id: Option<i64>,
    ) -> Result<AssetSelection> {
        let changed = self
            .conn
            .execute(
                "UPDATE asset_selections SET provider_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![provider_id, id],
            )
            .context("Failed to update selection provider")?;
        if changed == 0 {
            anyhow::bail!("Asset selection {} not found", id);
        }
        self.get_selection(id)?
            .context("Asset selection not found after provider update")
    }

    /// Apply a provider change and a status change together. `provider` of
    /// `Some(None)` clears the provider.
    pub fn update_selection(
        &self,
        id: i64,
        provider: Option<Option<i64>>,
        status: Option<SelectionStatus>,
    ) -> Result<AssetSelection> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin selection transaction")?;
        let mut selection = None;
        if let Some(provider_id) = provider {
            selection = Some(self.set_selection_provider(id, provider_id)?);
        }
        if let Some(status) = status {
            selection = Some(self.update_selection_status(id, status)?);
        }
        tx.commit().context("Failed to commit selection update")?;

        match selection {
            Some(selection) => Ok(selection),
            None => self
                .get_selection(id)?
                .ok_or_else(|| anyhow::anyhow!("Asset selection {} not found", id)),
        }
    }

    pub fn list_selections(&self, analysis_id: i64) -> Result<Vec<AssetSelection>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECTION_COLUMNS} FROM asset_selections WHERE analysis_id = ?1 ORDER BY id"
            ))
            .context("Failed to prepare list_selections")?;
        let rows = stmt
            .query_map(params![analysis_id], SelectionRow::from_row)
            .context("Failed to query asset selections")?;
        let mut selections = Vec::new();
        for row in rows {
            selections.push(row.context("Failed to read selection row")?.into_selection()?);
        }
        Ok(selections)
    }

    // ── Service providers ─────────────────────────────────────────────

    pub fn list_providers(
        &self,
        asset_type: Option<AssetType>,
        include_inactive: bool,
    ) -> Result<Vec<ServiceProvider>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROVIDER_COLUMNS} FROM service_providers
                 WHERE (?1 IS NULL OR asset_type = ?1) AND (?2 OR is_active = 1)
                 ORDER BY asset_type, priority, name"
            ))
            .context("Failed to prepare list_providers")?;
        let rows = stmt
            .query_map(
                params![asset_type.map(|a| a.as_str()), include_inactive],
                ProviderRow::from_row,
            )
            .context("Failed to query providers")?;
        let mut providers = Vec::new();
        for row in rows {
            providers.push(row.context("Failed to read provider row")?.into_provider()?);
        }
        Ok(providers)
    }

    pub fn get_provider(&self, id: i64) -> Result<Option<ServiceProvider>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {PROVIDER_COLUMNS} FROM service_providers WHERE id = ?1"),
                params![id],
                ProviderRow::from_row,
            )
            .optional()
            .context("Failed to query provider")?;
        row.map(ProviderRow::into_provider).transpose()
    }

    pub fn get_provider_by_slug(&self, slug: &str) -> Result<Option<ServiceProvider>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {PROVIDER_COLUMNS} FROM service_providers WHERE slug = ?1"),
                params![slug],
                ProviderRow::from_row,
            )
            .optional()
            .context("Failed to query provider by slug")?;
        row.map(ProviderRow::into_provider).transpose()
    }

    pub fn set_provider_active(&self, id: i64, active: bool) -> Result<ServiceProvider> {
        let changed = self
            .conn
            .execute(
                "UPDATE service_providers SET is_active = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![active, id],
            )
            .context("Failed to update provider active flag")?;
        if changed == 0 {
            anyhow::bail!("Provider {} not found", id);
        }
        self.get_provider(id)?
            .context("Provider not found after active update")
    }

    /// Insert or refresh a provider by slug. `is_active` of an existing row is
    /// left alone so admin toggles survive a sync.
    pub fn upsert_provider(&self, provider: &NewProvider) -> Result<UpsertOutcome> {
        let Some(existing) = self.get_provider_by_slug(&provider.slug)? else {
            self.conn
                .execute(
                    "INSERT INTO service_providers
                        (slug, name, asset_type, description, signup_url, earnings_low, earnings_high, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        provider.slug,
                        provider.name,
                        provider.asset_type.as_str(),
                        provider.description,
                        provider.signup_url,
                        provider.earnings_low,
                        provider.earnings_high,
                        provider.priority,
                    ],
                )
                .context("Failed to insert provider")?;
            return Ok(UpsertOutcome::Inserted);
        };

        let same = existing.name == provider.name
            && existing.asset_type == provider.asset_type
            && existing.description == provider.description
            && existing.signup_url == provider.signup_url
            && existing.earnings_low == provider.earnings_low
            && existing.earnings_high == provider.earnings_high
            && existing.priority == provider.priority;
        if same {
            return Ok(UpsertOutcome::Unchanged);
        }

        self.conn
            .execute(
                "UPDATE service_providers SET
                    name = ?2, asset_type = ?3, description = ?4, signup_url = ?5,
                    earnings_low = ?6, earnings_high = ?7, priority = ?8,
                    updated_at = datetime('now')
                 WHERE slug = ?1",
                params![
                    provider.slug,
                    provider.name,
                    provider.asset_type.as_str(),
                    provider.description,
                    provider.signup_url,
                    provider.earnings_low,
                    provider.earnings_high,
                    provider.priority,
                ],
            )
            .context("Failed to update provider")?;
        Ok(UpsertOutcome::Updated)
    }

    /// Deactivate every active provider whose slug is not in `keep`.
    /// Returns how many rows were deactivated.
    pub fn deactivate_providers_except(&self, keep: &[String]) -> Result<usize> {
        let keep_json = serde_json::to_string(keep).context("Failed to serialize slugs")?;
        let changed = self
            .conn
            .execute(
                "UPDATE service_providers SET is_active = 0, updated_at = datetime('now')
                 WHERE is_active = 1 AND slug NOT IN (SELECT value FROM json_each(?1))",
                params![keep_json],
            )
            .context("Failed to deactivate providers")?;
        Ok(changed)
    }

    // ── Partner clicks ────────────────────────────────────────────────

    pub fn record_click(
        &self,
        user_id: i64,
        provider_id: i64,
        referral_url: &str,
    ) -> Result<PartnerClick> {
        self.conn
            .execute(
                "INSERT INTO partner_clicks (user_id, provider_id, referral_url) VALUES (?1, ?2, ?3)",
                params![user_id, provider_id, referral_url],
            )
            .context("Failed to insert partner click")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, user_id, provider_id, referral_url, clicked_at
                 FROM partner_clicks WHERE id = ?1",
                params![id],
                |row| {
                    Ok(PartnerClick {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        provider_id: row.get(2)?,
                        referral_url: row.get(3)?,
                        clicked_at: row.get(4)?,
                    })
                },
            )
            .context("Partner click not found after insert")
    }

    /// Click counts for every provider, busiest first.
    pub fn click_stats(&self) -> Result<Vec<ClickStats>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.id, p.slug, p.name, COUNT(c.id), COUNT(DISTINCT c.user_id)
                 FROM service_providers p
                 LEFT JOIN partner_clicks c ON c.provider_id = p.id
                 GROUP BY p.id
                 ORDER BY COUNT(c.id) DESC, p.id",
            )
            .context("Failed to prepare click_stats")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ClickStats {
                    provider_id: row.get(0)?,
                    slug: row.get(1)?,
                    name: row.get(2)?,
                    clicks: row.get(3)?,
                    unique_users: row.get(4)?,
                })
            })
            .context("Failed to query click stats")?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row.context("Failed to read click stats row")?);
        }
        Ok(stats)
    }

    // ── Journey ───────────────────────────────────────────────────────

    /// Record a journey step. Recording a step twice keeps the first
    /// completion time and metadata.
    pub fn record_journey_step(
        &self,
        user_id: i64,
        step: JourneyStep,
        metadata: Option<&serde_json::Value>,
    ) -> Result<JourneyEntry> {
        let metadata = metadata
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize journey metadata")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO journey_steps (user_id, step, metadata) VALUES (?1, ?2, ?3)",
                params![user_id, step.as_str(), metadata],
            )
            .context("Failed to insert journey step")?;
        let row = self
            .conn
            .query_row(
                "SELECT step, metadata, completed_at FROM journey_steps
                 WHERE user_id = ?1 AND step = ?2",
                params![user_id, step.as_str()],
                JourneyRow::from_row,
            )
            .context("Journey step not found after insert")?;
        row.into_entry()
    }

    pub fn list_journey_steps(&self, user_id: i64) -> Result<Vec<JourneyEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT step, metadata, completed_at FROM journey_steps
                 WHERE user_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_journey_steps")?;
        let rows = stmt
            .query_map(params![user_id], JourneyRow::from_row)
            .context("Failed to query journey steps")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read journey row")?.into_entry()?);
        }
        Ok(entries)
    }

    // ── Chat ──────────────────────────────────────────────────────────

    pub fn create_chat_thread(
        &self,
        user_id: i64,
        remote_thread_id: Option<&str>,
        mode: ChatMode,
    ) -> Result<ChatThread> {
        self.conn
            .execute(
                "INSERT INTO chat_threads (user_id, remote_thread_id, mode) VALUES (?1, ?2, ?3)",
                params![user_id, remote_thread_id, mode.as_str()],
            )
            .context("Failed to insert chat thread")?;
        let id = self.conn.last_insert_rowid();
        self.get_chat_thread(id)?
            .context("Chat thread not found after insert")
    }

    pub fn get_chat_thread(&self, id: i64) -> Result<Option<ChatThread>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, remote_thread_id, mode, created_at FROM chat_threads WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query chat thread")?;
        row.map(|(id, user_id, remote_thread_id, mode, created_at)| {
            Ok(ChatThread {
                id,
                user_id,
                remote_thread_id,
                mode: parse_enum(&mode, "chat mode")?,
                created_at,
            })
        })
        .transpose()
    }

    pub fn update_chat_thread(
        &self,
        id: i64,
        remote_thread_id: Option<&str>,
        mode: ChatMode,
    ) -> Result<ChatThread> {
        self.conn
            .execute(
                "UPDATE chat_threads SET remote_thread_id = ?1, mode = ?2 WHERE id = ?3",
                params![remote_thread_id, mode.as_str(), id],
            )
            .context("Failed to update chat thread")?;
        self.get_chat_thread(id)?
            .context("Chat thread not found after update")
    }

    pub fn add_chat_message(
        &self,
        thread_id: i64,
        role: ChatRole,
        content: &str,
    ) -> Result<ChatMessage> {
        self.conn
            .execute(
                "INSERT INTO chat_messages (thread_id, role, content) VALUES (?1, ?2, ?3)",
                params![thread_id, role.as_str(), content],
            )
            .context("Failed to insert chat message")?;
        let id = self.conn.last_insert_rowid();
        Ok(ChatMessage {
            id,
            thread_id,
            role,
            content: content.to_string(),
            created_at: self
                .conn
                .query_row(
                    "SELECT created_at FROM chat_messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .context("Chat message not found after insert")?,
        })
    }

    pub fn list_chat_messages(&self, thread_id: i64) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, thread_id, role, content, created_at FROM chat_messages
                 WHERE thread_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_chat_messages")?;
        let rows = stmt
            .query_map(params![thread_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query chat messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, thread_id, role, content, created_at) =
                row.context("Failed to read chat message row")?;
            messages.push(ChatMessage {
                id,
                thread_id,
                role: parse_enum(&role, "chat role")?,
                content,
                created_at,
            });
        }
        Ok(messages)
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    // ── Dashboard ─────────────────────────────────────────────────────

    /// Everything the owner's home screen needs in one read. The latest
    /// analysis is taken from the primary address when there is one.
    pub fn dashboard(&self, user_id: i64) -> Result<Dashboard> {
        let user = self
            .get_user(user_id)?
            .with_context(|| format!("User {} not found", user_id))?;
        let primary_address = self.primary_address(user_id)?;
        let latest_analysis = match &primary_address {
            Some(address) => self.latest_analysis_for_address(address.id)?,
            None => self.latest_analysis_for_user(user_id)?,
        };
        let selections = match &latest_analysis {
            Some(analysis) => self.list_selections(analysis.id)?,
            None => Vec::new(),
        };

        let potential_monthly_revenue = latest_analysis
            .as_ref()
            .map(|a| a.report.total_monthly_revenue)
            .unwrap_or(0.0);
        let selected: f64 = selections
            .iter()
            .filter(|s| s.status.counts_toward_revenue())
            .map(|s| s.monthly_revenue)
            .sum();
        let steps: Vec<JourneyStep> = self
            .list_journey_steps(user_id)?
            .into_iter()
            .map(|e| e.step)
            .collect();

        Ok(Dashboard {
            user,
            primary_address,
            latest_analysis,
            selections,
            potential_monthly_revenue,
            selected_monthly_revenue: (selected * 100.0).round() / 100.0,
            journey: JourneyProgress::from_steps(&steps),
        })
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Insert an address row on a connection that already has a transaction
/// open. Returns the new row id.
fn insert_address(
    conn: &Connection,
    user_id: i64,
    location: &GeocodedAddress,
    make_primary: bool,
) -> Result<i64> {
    let existing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM addresses WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .context("Failed to count addresses")?;
    let primary = make_primary || existing == 0;
    if primary {
        conn.execute(
            "UPDATE addresses SET is_primary = 0, updated_at = datetime('now')
             WHERE user_id = ?1 AND is_primary = 1",
            params![user_id],
        )
        .context("Failed to demote primary address")?;
    }

    conn.execute(
        "INSERT INTO addresses
            (user_id, formatted_address, latitude, longitude, street, city, state, postal_code, is_primary)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            user_id,
            location.formatted_address,
            location.latitude,
            location.longitude,
            location.street,
            location.city,
            location.state,
            location.postal_code,
            primary,
        ],
    )
    .context("Failed to insert address")?;
    Ok(conn.last_insert_rowid())
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn address_from_row(row: &Row<'_>) -> rusqlite::Result<Address> {
    Ok(Address {
        id: row.get(0)?,
        user_id: row.get(1)?,
        location: GeocodedAddress {
            formatted_address: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            street: row.get(5)?,
            city: row.get(6)?,
            state: row.get(7)?,
            postal_code: row.get(8)?,
        },
        is_primary: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Intermediate row struct for analyses before the opportunities JSON and
/// source string are decoded.
struct AnalysisRow {
    id: i64,
    address_id: i64,
    user_id: i64,
    property_type: String,
    summary: String,
    opportunities: String,
    total_monthly_revenue: f64,
    source: String,
    model: Option<String>,
    satellite_image_url: Option<String>,
    created_at: String,
}

impl AnalysisRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            address_id: row.get(1)?,
            user_id: row.get(2)?,
            property_type: row.get(3)?,
            summary: row.get(4)?,
            opportunities: row.get(5)?,
            total_monthly_revenue: row.get(6)?,
            source: row.get(7)?,
            model: row.get(8)?,
            satellite_image_url: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_analysis(self) -> Result<PropertyAnalysis> {
        let opportunities: Vec<AssetOpportunity> = serde_json::from_str(&self.opportunities)
            .context("Failed to parse analysis opportunities JSON")?;
        Ok(PropertyAnalysis {
            id: self.id,
            address_id: self.address_id,
            user_id: self.user_id,
            report: PropertyReport {
                property_type: self.property_type,
                summary: self.summary,
                opportunities,
                total_monthly_revenue: self.total_monthly_revenue,
                source: parse_enum(&self.source, "analysis source")?,
                model: self.model,
                satellite_image_url: self.satellite_image_url,
            },
            created_at: self.created_at,
        })
    }
}

struct SelectionRow {
    id: i64,
    analysis_id: i64,
    user_id: i64,
    asset_type: String,
    monthly_revenue: f64,
    status: String,
    provider_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl SelectionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            analysis_id: row.get(1)?,
            user_id: row.get(2)?,
            asset_type: row.get(3)?,
            monthly_revenue: row.get(4)?,
            status: row.get(5)?,
            provider_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_selection(self) -> Result<AssetSelection> {
        Ok(AssetSelection {
            id: self.id,
            analysis_id: self.analysis_id,
            user_id: self.user_id,
            asset_type: parse_enum(&self.asset_type, "asset type")?,
            monthly_revenue: self.monthly_revenue,
            status: parse_enum(&self.status, "selection status")?,
            provider_id: self.provider_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ProviderRow {
    id: i64,
    slug: String,
    name: String,
    asset_type: String,
    description: String,
    signup_url: String,
    earnings_low: f64,
    earnings_high: f64,
    priority: i32,
    is_active: bool,
    updated_at: String,
}

impl ProviderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            asset_type: row.get(3)?,
            description: row.get(4)?,
            signup_url: row.get(5)?,
            earnings_low: row.get(6)?,
            earnings_high: row.get(7)?,
            priority: row.get(8)?,
            is_active: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_provider(self) -> Result<ServiceProvider> {
        Ok(ServiceProvider {
            id: self.id,
            slug: self.slug,
            name: self.name,
            asset_type: parse_enum(&self.asset_type, "provider asset type")?,
            description: self.description,
            signup_url: self.signup_url,
            earnings_low: self.earnings_low,
            earnings_high: self.earnings_high,
            priority: self.priority,
            is_active: self.is_active,
            updated_at: self.updated_at,
        })
    }
}

struct JourneyRow {
    step: String,
    metadata: Option<String>,
    completed_at: String,
}

impl JourneyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            step: row.get(0)?,
            metadata: row.get(1)?,
            completed_at: row.get(2)?,
        })
    }

    fn into_entry(self) -> Result<JourneyEntry> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse journey metadata JSON")?;
        Ok(JourneyEntry {
            step: parse_enum(&self.step, "journey step")?,
            metadata,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
