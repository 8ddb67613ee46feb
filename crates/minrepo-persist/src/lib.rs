//! Idempotent sinks for cleaned result rows.
//!
//! Both sinks enforce the same uniqueness model: prefecture by name, hall by
//! `(name, prefecture)`, model by name, result by `(hall, model, unit_no, date)`.
//! Loading the same rows twice changes nothing the second time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use minrepo_core::{LoadReport, ResultRow};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "minrepo-persist";

/// DDL for the hosted Postgres tables the remote sink writes to.
pub const REMOTE_SCHEMA_SQL: &str = include_str!("../sql/remote_schema.sql");

pub const REMOTE_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{table}: remote returned HTTP {status}: {body}")]
    Status {
        table: String,
        status: u16,
        body: String,
    },
    #[error("missing credential {0}")]
    MissingCredential(&'static str),
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn load(&self, rows: &[ResultRow]) -> Result<LoadReport, PersistenceError>;
}

/// Rows with a complete prefecture/hall/model triple, plus the skipped count.
/// When a fact key repeats, the first row is kept and later ones dropped.
fn loadable_rows(rows: &[ResultRow]) -> (Vec<&ResultRow>, u64) {
    let mut kept = Vec::with_capacity(rows.len());
    let mut seen = BTreeSet::new();
    let mut skipped = 0u64;
    for row in rows {
        if row.pref.trim().is_empty() || row.hall.trim().is_empty() || row.model.trim().is_empty() {
            warn!(
                pref = %row.pref,
                hall = %row.hall,
                model = %row.model,
                unit_no = row.unit_no,
                "row has an empty dimension name, skipping"
            );
            skipped += 1;
            continue;
        }
        let key = (
            row.pref.as_str(),
            row.hall.as_str(),
            row.model.as_str(),
            row.unit_no,
            row.date,
        );
        if !seen.insert(key) {
            debug!(
                hall = %row.hall,
                model = %row.model,
                unit_no = row.unit_no,
                date = %row.date,
                "repeated fact key, keeping the first row"
            );
            continue;
        }
        kept.push(row);
    }
    (kept, skipped)
}

pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Opens (creating if needed) the database file. One connection is enough
    /// for a sequential loader.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened sqlite database");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("sqlite migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self, rows: &[ResultRow]) -> Result<LoadReport, PersistenceError> {
        let (rows, skipped_rows) = loadable_rows(rows);
        let mut report = LoadReport {
            skipped_rows,
            ..Default::default()
        };

        // Dropping `tx` without commit rolls everything back.
        let mut tx = self.pool.begin().await?;

        let mut prefecture_ids: BTreeMap<&str, i64> = BTreeMap::new();
        let mut hall_ids: BTreeMap<(&str, i64), i64> = BTreeMap::new();
        let mut model_ids: BTreeMap<&str, i64> = BTreeMap::new();

        for row in rows {
            let prefecture_id = match prefecture_ids.get(row.pref.as_str()) {
                Some(id) => *id,
                None => {
                    report.new_prefectures +=
                        sqlx::query("INSERT OR IGNORE INTO prefectures (name) VALUES (?)")
                            .bind(&row.pref)
                            .execute(&mut *tx)
                            .await?
                            .rows_affected();
                    let id: i64 =
                        sqlx::query_scalar("SELECT prefecture_id FROM prefectures WHERE name = ?")
                            .bind(&row.pref)
                            .fetch_one(&mut *tx)
                            .await?;
                    prefecture_ids.insert(row.pref.as_str(), id);
                    id
                }
            };

            let hall_id = match hall_ids.get(&(row.hall.as_str(), prefecture_id)) {
                Some(id) => *id,
                None => {
                    report.new_halls += sqlx::query(
                        "INSERT OR IGNORE INTO halls (name, prefecture_id) VALUES (?, ?)",
                    )
                    .bind(&row.hall)
                    .bind(prefecture_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    let id: i64 = sqlx::query_scalar(
                        "SELECT hall_id FROM halls WHERE name = ? AND prefecture_id = ?",
                    )
                    .bind(&row.hall)
                    .bind(prefecture_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    hall_ids.insert((row.hall.as_str(), prefecture_id), id);
                    id
                }
            };

            let model_id = match model_ids.get(row.model.as_str()) {
                Some(id) => *id,
                None => {
                    report.new_models +=
                        sqlx::query("INSERT OR IGNORE INTO models (name) VALUES (?)")
                            .bind(&row.model)
                            .execute(&mut *tx)
                            .await?
                            .rows_affected();
                    let id: i64 = sqlx::query_scalar("SELECT model_id FROM models WHERE name = ?")
                        .bind(&row.model)
                        .fetch_one(&mut *tx)
                        .await?;
                    model_ids.insert(row.model.as_str(), id);
                    id
                }
            };

            report.new_results += sqlx::query(
                r#"
                INSERT OR IGNORE INTO results
                    (hall_id, model_id, unit_no, date, game, bb, rb, medal)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(hall_id)
            .bind(model_id)
            .bind(row.unit_no)
            .bind(row.date)
            .bind(row.game)
            .bind(row.bb)
            .bind(row.rb)
            .bind(row.medal)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        info!(
            backend = "sqlite",
            new_prefectures = report.new_prefectures,
            new_halls = report.new_halls,
            new_models = report.new_models,
            new_results = report.new_results,
            skipped_rows = report.skipped_rows,
            "load committed"
        );
        Ok(report)
    }
}

/// Table-level operations of a PostgREST-style API.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Inserts `rows`, merging into existing rows that collide on `on_conflict`.
    async fn upsert(&self, table: &str, on_conflict: &str, rows: &[Value])
        -> Result<(), PersistenceError>;

    async fn select_all(&self, table: &str, columns: &str) -> Result<Vec<Value>, PersistenceError>;

    async fn count(&self, table: &str) -> Result<u64, PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub service_role_key: String,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn from_env() -> Result<Self, PersistenceError> {
        let url = std::env::var("SUPABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PersistenceError::MissingCredential("SUPABASE_URL"))?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PersistenceError::MissingCredential("SUPABASE_SERVICE_ROLE_KEY"))?;
        let timeout = std::env::var("MINREPO_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(90));
        Ok(Self {
            url,
            service_role_key,
            timeout,
        })
    }
}

pub struct PostgrestClient {
    http: reqwest::Client,
    base_url: String,
    key: String,
}

const SELECT_PAGE_SIZE: usize = 1000;

impl PostgrestClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, PersistenceError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            key: config.service_role_key.clone(),
        })
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("apikey", &self.key).bearer_auth(&self.key)
    }
}

async fn ensure_success(
    table: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, PersistenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PersistenceError::Status {
        table: table.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Total from a `Content-Range` header such as `0-0/42` or `*/0`.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl RestClient for PostgrestClient {
    async fn upsert(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &[Value],
    ) -> Result<(), PersistenceError> {
        let url = format!("{}?on_conflict={}", self.endpoint(table), on_conflict);
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;
        ensure_success(table, response).await?;
        debug!(table, rows = rows.len(), "upsert accepted");
        Ok(())
    }

    async fn select_all(&self, table: &str, columns: &str) -> Result<Vec<Value>, PersistenceError> {
        let url = format!("{}?select={}", self.endpoint(table), columns);
        let mut out = Vec::new();
        loop {
            let start = out.len();
            let end = start + SELECT_PAGE_SIZE - 1;
            let response = self
                .authorized(self.http.get(&url))
                .header("Range-Unit", "items")
                .header("Range", format!("{start}-{end}"))
                .send()
                .await?;
            let page: Vec<Value> = ensure_success(table, response).await?.json().await?;
            let fetched = page.len();
            out.extend(page);
            if fetched < SELECT_PAGE_SIZE {
                break;
            }
        }
        Ok(out)
    }

    async fn count(&self, table: &str) -> Result<u64, PersistenceError> {
        let url = format!("{}?select=*&limit=1", self.endpoint(table));
        let response = self
            .authorized(self.http.get(url))
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = ensure_success(table, response).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| {
                PersistenceError::UnexpectedPayload(format!("{table}: no usable Content-Range"))
            })
    }
}

pub struct RemoteSink<C: RestClient> {
    client: C,
    batch_size: usize,
}

impl<C: RestClient> RemoteSink<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            batch_size: REMOTE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn table_counts(&self) -> Result<[u64; 4], PersistenceError> {
        Ok([
            self.client.count("prefectures").await?,
            self.client.count("halls").await?,
            self.client.count("models").await?,
            self.client.count("results").await?,
        ])
    }

    async fn name_map(
        &self,
        table: &str,
        id_column: &str,
    ) -> Result<BTreeMap<String, i64>, PersistenceError> {
        let columns = format!("{id_column},name");
        let mut map = BTreeMap::new();
        for value in self.client.select_all(table, &columns).await? {
            let name = str_field(&value, "name")?;
            let id = i64_field(&value, id_column)?;
            map.insert(name, id);
        }
        Ok(map)
    }

    async fn hall_map(&self) -> Result<BTreeMap<(String, i64), i64>, PersistenceError> {
        let mut map = BTreeMap::new();
        for value in self
            .client
            .select_all("halls", "hall_id,name,prefecture_id")
            .await?
        {
            let name = str_field(&value, "name")?;
            let prefecture_id = i64_field(&value, "prefecture_id")?;
            map.insert((name, prefecture_id), i64_field(&value, "hall_id")?);
        }
        Ok(map)
    }

    async fn upsert_batched(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &[Value],
    ) -> Result<(), PersistenceError> {
        for chunk in rows.chunks(self.batch_size) {
            self.client.upsert(table, on_conflict, chunk).await?;
        }
        Ok(())
    }
}

fn str_field(value: &Value, field: &str) -> Result<String, PersistenceError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            PersistenceError::UnexpectedPayload(format!("missing string `{field}` in {value}"))
        })
}

fn i64_field(value: &Value, field: &str) -> Result<i64, PersistenceError> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            PersistenceError::UnexpectedPayload(format!("missing integer `{field}` in {value}"))
        })
}

#[async_trait]
impl<C: RestClient> ResultSink for RemoteSink<C> {
    fn backend(&self) -> &'static str {
        "remote"
    }

    async fn load(&self, rows: &[ResultRow]) -> Result<LoadReport, PersistenceError> {
        let (rows, skipped_rows) = loadable_rows(rows);
        let before = self.table_counts().await?;

        let prefectures = rows
            .iter()
            .map(|r| r.pref.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|name| json!({ "name": name }))
            .collect::<Vec<_>>();
        self.upsert_batched("prefectures", "name", &prefectures).await?;
        let prefecture_ids = self.name_map("prefectures", "prefecture_id").await?;

        let mut halls = BTreeSet::new();
        for row in &rows {
            match prefecture_ids.get(&row.pref) {
                Some(pid) => {
                    halls.insert((row.hall.as_str(), *pid));
                }
                None => warn!(pref = %row.pref, "prefecture missing after upsert"),
            }
        }
        let halls = halls
            .into_iter()
            .map(|(name, pid)| json!({ "name": name, "prefecture_id": pid }))
            .collect::<Vec<_>>();
        self.upsert_batched("halls", "name,prefecture_id", &halls).await?;

        let models = rows
            .iter()
            .map(|r| r.model.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|name| json!({ "name": name }))
            .collect::<Vec<_>>();
        self.upsert_batched("models", "name", &models).await?;

        let hall_ids = self.hall_map().await?;
        let model_ids = self.name_map("models", "model_id").await?;

        // A batch may not touch the same key twice.
        let mut facts: BTreeMap<(i64, i64, i64, String), Value> = BTreeMap::new();
        let mut unresolved = 0u64;
        for row in &rows {
            let hall_id = prefecture_ids
                .get(&row.pref)
                .and_then(|pid| hall_ids.get(&(row.hall.clone(), *pid)));
            let model_id = model_ids.get(&row.model);
            let (Some(hall_id), Some(model_id)) = (hall_id, model_id) else {
                warn!(
                    hall = %row.hall,
                    model = %row.model,
                    "dimension lookup failed, skipping row"
                );
                unresolved += 1;
                continue;
            };
            let date = row.date.format("%Y-%m-%d").to_string();
            facts
                .entry((*hall_id, *model_id, row.unit_no, date.clone()))
                .or_insert_with(|| {
                    json!({
                        "hall_id": hall_id,
                        "model_id": model_id,
                        "unit_no": row.unit_no,
                        "date": date,
                        "game": row.game,
                        "bb": row.bb,
                        "rb": row.rb,
                        "medal": row.medal,
                    })
                });
        }
        let facts = facts.into_values().collect::<Vec<_>>();
        self.upsert_batched("results", "hall_id,model_id,unit_no,date", &facts)
            .await?;

        let after = self.table_counts().await?;
        let report = LoadReport {
            new_prefectures: after[0].saturating_sub(before[0]),
            new_halls: after[1].saturating_sub(before[1]),
            new_models: after[2].saturating_sub(before[2]),
            new_results: after[3].saturating_sub(before[3]),
            skipped_rows: skipped_rows + unresolved,
        };
        info!(
            backend = "remote",
            new_prefectures = report.new_prefectures,
            new_halls = report.new_halls,
            new_models = report.new_models,
            new_results = report.new_results,
            skipped_rows = report.skipped_rows,
            batches = facts.len().div_ceil(self.batch_size),
            "remote load complete"
        );
        Ok(report)
    }
}
