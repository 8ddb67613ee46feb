//! Run orchestration: hall registry, aggregation, row cleaning, sink loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use minrepo_adapters::MinRepoNavigator;
use minrepo_core::{HallRegistry, HallTarget, LoadReport, RawFrame, ResultRow};
use minrepo_persist::{PostgrestClient, RemoteConfig, RemoteSink, ResultSink, SqliteSink};
use minrepo_storage::{
    read_rows_csv, ArtifactStore, HttpClientConfig, HttpFetcher, HttpPageSession, PageSession,
    StoredArtifact,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "minrepo-sync";

pub const DEFAULT_BASE_URL: &str = "https://min-repo.com/tag/";

/// Column order of the aggregated raw table.
pub const RAW_COLUMNS: [&str; 9] = ["pref", "hall", "model", "date", "台番", "G数", "BB", "RB", "差枚"];

/// Column order of the cleaned table; matches the `ResultRow` fields.
pub const CLEAN_COLUMNS: [&str; 9] = [
    "pref", "hall", "model", "date", "unit_no", "game", "bb", "rb", "medal",
];

pub const RAW_CSV_NAME: &str = "halls.csv";
pub const CLEAN_CSV_NAME: &str = "halls_date_cleaner.csv";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub halls_yaml: PathBuf,
    pub aliases_yaml: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub log_path: PathBuf,
    pub db_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("MINREPO_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            halls_yaml: std::env::var("MINREPO_HALLS_YAML")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("halls.yaml")),
            aliases_yaml: std::env::var("MINREPO_ALIASES_YAML")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            artifacts_dir: std::env::var("MINREPO_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/csv")),
            log_path: std::env::var("MINREPO_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/log/minrepo.log")),
            db_path: std::env::var("MINREPO_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/db/minrepo.db")),
            user_agent: std::env::var("MINREPO_USER_AGENT")
                .unwrap_or_else(|_| format!("minrepo-bot/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("MINREPO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
        }
    }
}

pub fn load_hall_registry(path: &Path) -> Result<HallRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading hall list {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing hall list {}", path.display()))
}

/// Base URL joined with the percent-encoded slug.
pub fn hall_url(base_url: &str, slug: &str) -> Result<String> {
    let base = Url::parse(base_url).with_context(|| format!("invalid base url {base_url}"))?;
    let url = base
        .join(&urlencoding::encode(slug))
        .with_context(|| format!("joining slug {slug} onto {base_url}"))?;
    Ok(url.to_string())
}

static LOGGING: OnceLock<()> = OnceLock::new();

/// Console plus plain-text file logging. Only the first call installs the
/// subscriber; later calls return `None`. Keep the guard alive until exit.
pub fn init_logging(log_path: &Path) -> Result<Option<WorkerGuard>> {
    if LOGGING.get().is_some() {
        return Ok(None);
    }
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .is_ok();
    let _ = LOGGING.set(());

    Ok(installed.then_some(guard))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("row {row}: `{column}` is empty")]
    Missing { row: usize, column: &'static str },
    #[error("row {row}: `{column}` value `{value}` is not an integer")]
    NotInteger {
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("row {row}: `{column}` must not be negative, got {value}")]
    Negative {
        row: usize,
        column: &'static str,
        value: i64,
    },
    #[error("row {row}: `{value}` is not a YYYY-MM-DD date")]
    InvalidDate { row: usize, value: String },
}

pub fn default_column_renames() -> BTreeMap<String, String> {
    [
        ("pref", "pref"),
        ("prefecture", "pref"),
        ("h_name", "hall"),
        ("m_name", "model"),
        ("model_name", "model"),
        ("date", "date"),
        ("台番", "unit_no"),
        ("G数", "game"),
        ("BB", "bb"),
        ("RB", "rb"),
        ("差枚", "medal"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn default_model_aliases() -> BTreeMap<String, String> {
    [
        ("SミスタージャグラーKK", "ミスタージャグラー"),
        ("S ミスタージャグラー KK", "ミスタージャグラー"),
        ("SアイムジャグラーEX", "アイムジャグラーEX-TP"),
        ("ファンキージャグラー2KT", "ファンキージャグラー2"),
        ("ジャグラーガールズSS", "ジャグラーガールズ"),
        ("S ネオアイムジャグラーEX KK", "ネオアイムジャグラーEX"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Optional replacement tables read from `MINREPO_ALIASES_YAML`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasOverrides {
    #[serde(default)]
    pub model_aliases: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub column_renames: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct RowCleaner {
    column_renames: BTreeMap<String, String>,
    model_aliases: BTreeMap<String, String>,
}

impl Default for RowCleaner {
    fn default() -> Self {
        Self::new(default_column_renames(), default_model_aliases())
    }
}

impl RowCleaner {
    pub fn new(
        column_renames: BTreeMap<String, String>,
        model_aliases: BTreeMap<String, String>,
    ) -> Self {
        Self {
            column_renames,
            model_aliases,
        }
    }

    pub fn with_overrides(mut self, overrides: AliasOverrides) -> Self {
        if let Some(aliases) = overrides.model_aliases {
            self.model_aliases = aliases;
        }
        if let Some(renames) = overrides.column_renames {
            self.column_renames = renames;
        }
        self
    }

    pub fn from_overrides_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading alias overrides {}", path.display()))?;
        let overrides: AliasOverrides = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing alias overrides {}", path.display()))?;
        Ok(Self::default().with_overrides(overrides))
    }

    pub fn canonical_model<'a>(&'a self, name: &'a str) -> &'a str {
        self.model_aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    /// Renames columns, applies model aliases, and casts the numeric columns.
    /// Any bad numeric cell fails the whole batch.
    pub fn clean(&self, frame: &RawFrame) -> Result<Vec<ResultRow>, FormatError> {
        let mut renamed = frame.clone();
        renamed.rename_columns(&self.column_renames);
        let table = renamed.select(&CLEAN_COLUMNS);

        let mut out = Vec::with_capacity(table.len());
        for (i, row) in table.rows().iter().enumerate() {
            let text = |idx: usize| row[idx].as_deref().map(str::trim).unwrap_or("");
            let date_text = text(3);
            let date = NaiveDate::parse_from_str(date_text, "%Y-%m-%d").map_err(|_| {
                FormatError::InvalidDate {
                    row: i,
                    value: date_text.to_string(),
                }
            })?;

            out.push(ResultRow {
                pref: text(0).to_string(),
                hall: text(1).to_string(),
                model: self.canonical_model(text(2)).to_string(),
                date,
                unit_no: integer_cell(i, "unit_no", text(4))?,
                game: non_negative(i, "game", integer_cell(i, "game", text(5))?)?,
                bb: non_negative(i, "bb", integer_cell(i, "bb", text(6))?)?,
                rb: non_negative(i, "rb", integer_cell(i, "rb", text(7))?)?,
                medal: integer_cell(i, "medal", text(8))?,
            });
        }
        Ok(out)
    }
}

/// `"12,345"` → `12345`, `"+1,200"` → `1200`. Never defaults to zero.
pub fn parse_count(raw: &str) -> Option<i64> {
    let digits = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect::<String>();
    digits.parse().ok()
}

fn integer_cell(row: usize, column: &'static str, raw: &str) -> Result<i64, FormatError> {
    if raw.is_empty() {
        return Err(FormatError::Missing { row, column });
    }
    parse_count(raw).ok_or_else(|| FormatError::NotInteger {
        row,
        column,
        value: raw.to_string(),
    })
}

fn non_negative(row: usize, column: &'static str, value: i64) -> Result<i64, FormatError> {
    if value < 0 {
        return Err(FormatError::Negative { row, column, value });
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Sqlite,
    Remote,
    None,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    /// Aggregated rows in [`RAW_COLUMNS`] order.
    pub frame: RawFrame,
    pub halls_total: usize,
    pub halls_failed: usize,
    pub artifacts: Vec<StoredArtifact>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub halls_total: usize,
    pub halls_failed: usize,
    pub raw_rows: usize,
    pub cleaned_rows: usize,
    pub backend: Option<&'static str>,
    pub load: Option<LoadReport>,
    pub artifacts_dir: String,
    pub manifest: String,
}

impl SyncRunSummary {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ArtifactStore,
    cleaner: RowCleaner,
    navigator: MinRepoNavigator,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let cleaner = match &config.aliases_yaml {
            Some(path) => RowCleaner::from_overrides_file(path)?,
            None => RowCleaner::default(),
        };
        Ok(Self {
            store: ArtifactStore::new(config.artifacts_dir.clone()),
            config,
            cleaner,
            navigator: MinRepoNavigator::default(),
        })
    }

    pub fn with_navigator(mut self, navigator: MinRepoNavigator) -> Self {
        self.navigator = navigator;
        self
    }

    /// Scrape, clean, write artifacts, then load into `sink` if one is given.
    /// The session is closed before this returns, also on error.
    pub async fn run_once<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        sink: Option<&dyn ResultSink>,
        limit_halls: Option<usize>,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let run_dir = ArtifactStore::run_dir(started_at);
        info!(%run_id, run_dir = %run_dir.display(), "run started");

        let registry = match load_hall_registry(&self.config.halls_yaml) {
            Ok(registry) => registry,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };
        let targets = match limit_halls {
            Some(limit) => &registry.halls[..limit.min(registry.halls.len())],
            None => &registry.halls[..],
        };

        let outcome = self.scrape(session, targets, &run_dir).await;
        session.close().await;

        let mut artifacts = outcome.artifacts;
        artifacts.push(
            self.store
                .write_frame_csv(run_dir.join(RAW_CSV_NAME), &outcome.frame)
                .await
                .context("writing raw csv")?,
        );

        let rows = self
            .cleaner
            .clean(&outcome.frame)
            .context("cleaning scraped rows")?;
        info!(raw = outcome.frame.len(), cleaned = rows.len(), "rows cleaned");

        artifacts.push(
            self.store
                .write_rows_csv(run_dir.join(CLEAN_CSV_NAME), &rows)
                .await
                .context("writing cleaned csv")?,
        );
        let manifest = self
            .store
            .write_manifest(&run_dir, &artifacts)
            .await
            .context("writing artifact manifest")?;

        let load = match sink {
            Some(sink) => Some(
                sink.load(&rows)
                    .await
                    .with_context(|| format!("loading rows into {}", sink.backend()))?,
            ),
            None => None,
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            halls_total: outcome.halls_total,
            halls_failed: outcome.halls_failed,
            raw_rows: outcome.frame.len(),
            cleaned_rows: rows.len(),
            backend: sink.map(|s| s.backend()),
            load,
            artifacts_dir: self.store.root().join(&run_dir).display().to_string(),
            manifest: manifest.display().to_string(),
        };
        info!(
            %run_id,
            halls = summary.halls_total,
            failed = summary.halls_failed,
            raw_rows = summary.raw_rows,
            cleaned_rows = summary.cleaned_rows,
            elapsed_ms = summary.elapsed().num_milliseconds(),
            "run finished"
        );
        Ok(summary)
    }

    /// Visits every target in order. A failing hall is logged and skipped.
    pub async fn scrape<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        targets: &[HallTarget],
        run_dir: &Path,
    ) -> ScrapeOutcome {
        let mut outcome = ScrapeOutcome {
            halls_total: targets.len(),
            ..Default::default()
        };
        let mut frames = Vec::new();

        for target in targets {
            let span = info_span!("hall", slug = %target.slug, period = target.period);
            let result = self
                .scrape_hall(session, target, run_dir, &mut outcome.artifacts)
                .instrument(span)
                .await;
            match result {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    error!(slug = %target.slug, error = ?err, "hall failed, skipping");
                    outcome.halls_failed += 1;
                }
            }
        }

        outcome.frame = RawFrame::concat(frames).select(&RAW_COLUMNS);
        info!(
            halls = outcome.halls_total,
            failed = outcome.halls_failed,
            rows = outcome.frame.len(),
            "aggregation finished"
        );
        outcome
    }

    async fn scrape_hall<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        target: &HallTarget,
        run_dir: &Path,
        artifacts: &mut Vec<StoredArtifact>,
    ) -> Result<RawFrame> {
        let url = hall_url(&self.config.base_url, &target.slug)?;
        let date_links = self
            .navigator
            .fetch_date_links(session, &url, target.period)
            .await
            .with_context(|| format!("hall page {url}"))?;

        let mut frames = Vec::with_capacity(date_links.len());
        for link in &date_links {
            let model_links = self
                .navigator
                .fetch_model_links(session, &link.hall_name, &link.prefecture, &link.url, link.date)
                .await
                .with_context(|| format!("date page {}", link.url))?;
            if model_links.is_empty() {
                warn!(date = %link.date, "no target models on date page");
                continue;
            }

            let frame = self
                .navigator
                .fetch_result_rows(session, &model_links)
                .await
                .with_context(|| format!("model pages for {}", link.date))?
                .select(&RAW_COLUMNS);
            if frame.is_empty() {
                continue;
            }

            let date = link.date.format("%Y-%m-%d").to_string();
            let name = ArtifactStore::csv_file_name(&[&link.prefecture, &link.hall_name, &date]);
            artifacts.push(self.store.write_frame_csv(run_dir.join(name), &frame).await?);
            frames.push(frame);
        }

        Ok(RawFrame::concat(frames))
    }
}

/// Opens the embedded database and applies pending migrations.
pub async fn open_sqlite_sink(path: &Path) -> Result<SqliteSink> {
    let sink = SqliteSink::open(path)
        .await
        .with_context(|| format!("opening sqlite database {}", path.display()))?;
    sink.migrate().await.context("applying sqlite migrations")?;
    Ok(sink)
}

pub fn remote_sink_from_env() -> Result<RemoteSink<PostgrestClient>> {
    let config = RemoteConfig::from_env().context("remote sink configuration")?;
    let client = PostgrestClient::new(&config).context("building remote client")?;
    Ok(RemoteSink::new(client))
}

pub async fn run_scrape_from_env(
    sink: SinkKind,
    limit_halls: Option<usize>,
) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let mut session = HttpPageSession::new(fetcher);
    let pipeline = SyncPipeline::new(config.clone())?;

    match sink {
        SinkKind::Sqlite => {
            let sqlite = open_sqlite_sink(&config.db_path).await?;
            let result = pipeline.run_once(&mut session, Some(&sqlite), limit_halls).await;
            sqlite.close().await;
            result
        }
        SinkKind::Remote => {
            let remote = remote_sink_from_env()?;
            pipeline.run_once(&mut session, Some(&remote), limit_halls).await
        }
        SinkKind::None => pipeline.run_once(&mut session, None, limit_halls).await,
    }
}

pub async fn migrate_from_env() -> Result<PathBuf> {
    let config = SyncConfig::from_env();
    let sink = open_sqlite_sink(&config.db_path).await?;
    sink.close().await;
    Ok(config.db_path)
}

/// Re-loads a cleaned CSV into the chosen sink.
pub async fn load_csv(csv_path: &Path, sink: &dyn ResultSink) -> Result<LoadReport> {
    let rows = read_rows_csv(csv_path)?;
    info!(path = %csv_path.display(), rows = rows.len(), "loading cleaned csv");
    sink.load(&rows)
        .await
        .with_context(|| format!("loading {} into {}", csv_path.display(), sink.backend()))
}

pub async fn load_csv_from_env(csv_path: &Path, sink: SinkKind) -> Result<LoadReport> {
    match sink {
        SinkKind::Sqlite => {
            let config = SyncConfig::from_env();
            let sqlite = open_sqlite_sink(&config.db_path).await?;
            let result = load_csv(csv_path, &sqlite).await;
            sqlite.close().await;
            result
        }
        SinkKind::Remote => load_csv(csv_path, &remote_sink_from_env()?).await,
        SinkKind::None => bail!("load needs a sink (sqlite or remote)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw_frame(rows: &[[&str; 9]]) -> RawFrame {
        let mut frame = RawFrame::new(RAW_COLUMNS.iter().map(|c| c.to_string()).collect());
        for row in rows {
            frame.push_row(row.iter().map(|c| Some(c.to_string())).collect());
        }
        frame
    }

    #[test]
    fn hall_url_percent_encodes_slug() {
        assert_eq!(
            hall_url(DEFAULT_BASE_URL, "hall-a").unwrap(),
            "https://min-repo.com/tag/hall-a"
        );
        assert_eq!(
            hall_url(DEFAULT_BASE_URL, "ホール").unwrap(),
            "https://min-repo.com/tag/%E3%83%9B%E3%83%BC%E3%83%AB"
        );
        assert!(hall_url("not a url", "x").is_err());
    }

    #[test]
    fn hall_registry_requires_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("halls.yaml");
        assert!(load_hall_registry(&missing).is_err());

        std::fs::write(
            &missing,
            "halls:\n  - slug: hall-a\n    period: 2\n  - slug: hall-b\n    period: 7\n",
        )
        .unwrap();
        let registry = load_hall_registry(&missing).unwrap();
        assert_eq!(registry.halls.len(), 2);
        assert_eq!(registry.halls[1].period, 7);
    }

    #[test]
    fn counts_strip_thousands_separators() {
        assert_eq!(parse_count("12,345"), Some(12345));
        assert_eq!(parse_count("+1,200"), Some(1200));
        assert_eq!(parse_count("-800"), Some(-800));
        assert_eq!(parse_count(" 7 "), Some(7));
        assert_eq!(parse_count("--"), None);
    }

    #[test]
    fn cleaner_renames_casts_and_aliases() {
        let frame = raw_frame(&[[
            "東京都",
            "ホールA",
            "SアイムジャグラーEX",
            "2024-03-05",
            "101",
            "5,432",
            "20",
            "15",
            "-1,200",
        ]]);
        let rows = RowCleaner::default().clean(&frame).unwrap();
        assert_eq!(
            rows,
            vec![ResultRow {
                pref: "東京都".into(),
                hall: "ホールA".into(),
                model: "アイムジャグラーEX-TP".into(),
                date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
                unit_no: 101,
                game: 5432,
                bb: 20,
                rb: 15,
                medal: -1200,
            }]
        );
    }

    #[test]
    fn every_alias_is_substituted_exactly() {
        let cleaner = RowCleaner::default();
        for (alias, canonical) in default_model_aliases() {
            assert_eq!(cleaner.canonical_model(&alias), canonical);
        }
        assert_eq!(cleaner.canonical_model("マイジャグラーV"), "マイジャグラーV");
        assert_eq!(cleaner.canonical_model("SミスタージャグラーKK "), "SミスタージャグラーKK ");
    }

    #[test]
    fn cleaner_rejects_bad_numbers() {
        let mut row = ["東京都", "ホールA", "M", "2024-03-05", "101", "5,432", "20", "15", "0"];
        row[5] = "abc";
        assert!(matches!(
            RowCleaner::default().clean(&raw_frame(&[row])),
            Err(FormatError::NotInteger { column: "game", .. })
        ));

        row[5] = "10";
        row[8] = "";
        assert_eq!(
            RowCleaner::default().clean(&raw_frame(&[row])),
            Err(FormatError::Missing {
                row: 0,
                column: "medal"
            })
        );

        row[8] = "0";
        row[6] = "-1";
        assert!(matches!(
            RowCleaner::default().clean(&raw_frame(&[row])),
            Err(FormatError::Negative { column: "bb", .. })
        ));
    }

    #[test]
    fn alias_overrides_replace_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aliases.yaml");
        std::fs::write(&path, "model_aliases:\n  マイジャグラーV: マイジャグラー\n").unwrap();
        let cleaner = RowCleaner::from_overrides_file(&path).unwrap();
        assert_eq!(cleaner.canonical_model("マイジャグラーV"), "マイジャグラー");
        assert_eq!(cleaner.canonical_model("SアイムジャグラーEX"), "SアイムジャグラーEX");

        let frame = raw_frame(&[["p", "h", "m", "2024-03-05", "1", "2", "3", "4", "5"]]);
        assert_eq!(cleaner.clean(&frame).unwrap()[0].game, 2);
    }

    #[test]
    fn shipped_alias_file_matches_builtin_table() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/aliases.yaml");
        let overrides: AliasOverrides =
            serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(overrides.model_aliases, Some(default_model_aliases()));
        assert!(overrides.column_renames.is_none());
    }

    #[test]
    fn logging_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log/minrepo.log");
        let first = init_logging(&path).unwrap();
        assert!(init_logging(&path).unwrap().is_none());
        assert!(path.exists());
        drop(first);
    }
}
