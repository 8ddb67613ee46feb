//! min-repo page navigators: hall page → date page → model page.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate};
use minrepo_core::{DateLink, ModelLink, RawFrame};
use minrepo_storage::{ElementHandle, NavigationError, PageError, PageSession};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;
use url::Url;

pub const CRATE_NAME: &str = "minrepo-adapters";

/// Substring that marks the machine family we collect.
pub const TARGET_MODEL: &str = "ジャグラー";
/// Unit-number cell text of the synthetic per-table summary row.
pub const AVERAGE_MARKER: &str = "平均";
/// Source label of the unit-number column.
pub const UNIT_NO_COLUMN: &str = "台番";

/// CSS selectors for the three page levels of the site.
pub mod selectors {
    pub const HALL_NAME: &str = "#content h1";
    pub const PREFECTURE: &str = "#content div span.todofuken";
    pub const DATE_LINKS: &str = "#content div table tbody tr td a";
    pub const DATE_TITLE: &str = "h1";
    pub const MODEL_LINKS: &str = "table.kishu tbody tr td a";
    pub const MODEL_HEADINGS: &str = "div.tab_content > h2";
    pub const RESULT_ROWS: &str = "div > div.table_wrap > table > tbody > tr";
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error(transparent)]
    Page(#[from] PageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("unrecognized date label `{0}`")]
    Unrecognized(String),
    #[error("`{0}` is not a valid calendar date")]
    InvalidDate(String),
}

static LISTING_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\s*(?:グラフ一覧|データ一覧|一覧).*$").expect("static listing suffix pattern")
});

static DATE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([0-9]{4})/)?([0-9]{1,2})/([0-9]{1,2})")
        .expect("static date label pattern")
});

pub fn normalize_text(raw: Option<&str>) -> String {
    raw.map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Model name from a heading such as `ハッピージャグラーＶＩＩＩ　グラフ一覧`:
/// width-normalized (NFKC), listing suffix removed, trimmed.
pub fn extract_model_name(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let normalized = raw.nfkc().collect::<String>();
    LISTING_SUFFIX.replace(&normalized, "").trim().to_string()
}

/// Parses `YYYY/MM/DD` or `M/D`, full-width digits included; a missing year
/// comes from `reference`.
pub fn parse_date_label(label: &str, reference: NaiveDate) -> Result<NaiveDate, DateParseError> {
    let normalized = label.nfkc().collect::<String>();
    let caps = DATE_LABEL
        .captures(normalized.trim())
        .ok_or_else(|| DateParseError::Unrecognized(label.to_string()))?;
    let invalid = || DateParseError::InvalidDate(label.to_string());

    let year = match caps.get(1) {
        Some(y) => y.as_str().parse::<i32>().map_err(|_| invalid())?,
        None => reference.year(),
    };
    let month = caps[2].parse::<u32>().map_err(|_| invalid())?;
    let day = caps[3].parse::<u32>().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
}

/// First heading containing `target`, else the first heading, else empty.
pub fn pick_model_name(headings: &[String], target: &str) -> String {
    headings
        .iter()
        .find(|h| h.contains(target))
        .or_else(|| headings.first())
        .cloned()
        .unwrap_or_default()
}

fn resolve_url(base: &str, href: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(String::from)
        .unwrap_or_else(|_| href.to_string())
}

/// Builds a frame from table rows: the first row's `th` cells are the header,
/// `td` rows are data. Empty rows and average rows are dropped. `None` when
/// the table has no header or no unit-number column.
pub fn parse_result_table(rows: &[ElementHandle]) -> Option<RawFrame> {
    let header = rows
        .first()?
        .find_all("th")
        .into_iter()
        .map(|th| normalize_text(Some(th.text_content())))
        .collect::<Vec<_>>();
    if header.is_empty() {
        return None;
    }
    let unit_idx = header.iter().position(|h| h == UNIT_NO_COLUMN)?;

    let mut frame = RawFrame::new(header);
    for row in rows {
        let cells = row
            .find_all("td")
            .into_iter()
            .map(|td| normalize_text(Some(td.text_content())))
            .collect::<Vec<_>>();
        if cells.iter().all(String::is_empty) {
            continue;
        }
        frame.push_row(cells.into_iter().map(Some).collect());
    }

    frame.retain_rows(|_, row| {
        !row[unit_idx]
            .as_deref()
            .is_some_and(|unit| unit.contains(AVERAGE_MARKER))
    });
    Some(frame)
}

#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub page_load_timeout: Duration,
    pub date_link_timeout: Duration,
    pub model_link_timeout: Duration,
    pub heading_timeout: Duration,
    pub table_timeout: Duration,
    pub target_model: String,
    /// Supplies the year for `M/D` labels.
    pub reference_date: NaiveDate,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(90),
            date_link_timeout: Duration::from_secs(15),
            model_link_timeout: Duration::from_secs(10),
            heading_timeout: Duration::from_secs(10),
            table_timeout: Duration::from_secs(15),
            target_model: TARGET_MODEL.to_string(),
            reference_date: Local::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MinRepoNavigator {
    config: NavigatorConfig,
}

impl MinRepoNavigator {
    pub fn new(config: NavigatorConfig) -> Self {
        Self { config }
    }

    /// Hall landing page → up to `period` most recent per-day links.
    pub async fn fetch_date_links<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        hall_url: &str,
        period: u32,
    ) -> Result<Vec<DateLink>, AdapterError> {
        info!(url = hall_url, "loading hall page");
        session
            .navigate(hall_url, self.config.page_load_timeout)
            .await?;

        let hall_name = first_text(session, selectors::HALL_NAME)?;
        let prefecture = first_text(session, selectors::PREFECTURE)?;
        info!(hall = %hall_name, prefecture = %prefecture, "hall page loaded");

        if !soft_wait(session, selectors::DATE_LINKS, self.config.date_link_timeout).await? {
            warn!(url = hall_url, "no date links on hall page");
            return Ok(Vec::new());
        }

        let links = session.locate_all(selectors::DATE_LINKS)?;
        let take = (period as usize).min(links.len());
        debug!(found = links.len(), take, "date links located");

        let base = session.current_url().unwrap_or(hall_url).to_string();
        let mut out = Vec::with_capacity(take);
        for link in links.iter().take(take) {
            let label = normalize_text(Some(link.text_content()));
            let date = match parse_date_label(&label, self.config.reference_date) {
                Ok(date) => date,
                Err(err) => {
                    warn!(%err, "skipping date link");
                    continue;
                }
            };
            let href = link.attribute("href").unwrap_or_default().trim();
            if href.is_empty() {
                warn!(label = %label, "date link has no href");
                continue;
            }
            out.push(DateLink {
                prefecture: prefecture.clone(),
                hall_name: hall_name.clone(),
                date,
                url: resolve_url(&base, href),
            });
        }

        info!(count = out.len(), "date links extracted");
        Ok(out)
    }

    /// Per-day page → links to target-model sub-pages.
    pub async fn fetch_model_links<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        hall_name: &str,
        prefecture: &str,
        date_url: &str,
        date: NaiveDate,
    ) -> Result<Vec<ModelLink>, AdapterError> {
        info!(url = date_url, "loading date page");
        session
            .navigate(date_url, self.config.page_load_timeout)
            .await?;
        let title = first_text(session, selectors::DATE_TITLE)?;
        debug!(title = %title, "date page loaded");

        if !soft_wait(session, selectors::MODEL_LINKS, self.config.model_link_timeout).await? {
            warn!(url = date_url, "no model links on date page");
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for link in session.locate_all(selectors::MODEL_LINKS)? {
            let label = normalize_text(Some(link.text_content()));
            if !label.contains(&self.config.target_model) {
                continue;
            }
            let Some(href) = link.attribute("href").map(str::trim).filter(|h| !h.is_empty())
            else {
                debug!(label = %label, "model link has no href");
                continue;
            };
            out.push(ModelLink {
                prefecture: prefecture.to_string(),
                hall_name: hall_name.to_string(),
                date,
                date_url: date_url.to_string(),
                url: href.to_string(),
            });
        }

        info!(count = out.len(), "model links extracted");
        Ok(out)
    }

    /// Model sub-pages → one frame of per-unit rows stamped with
    /// `pref`/`hall`/`model`/`date`. A link whose table never appears is
    /// skipped; the rest of the batch still runs.
    pub async fn fetch_result_rows<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        links: &[ModelLink],
    ) -> Result<RawFrame, AdapterError> {
        let mut frames = Vec::with_capacity(links.len());
        let mut skipped = 0usize;
        for link in links {
            match self.fetch_model_page(session, link).await? {
                Some(frame) => frames.push(frame),
                None => skipped += 1,
            }
        }
        let frame = RawFrame::concat(frames);
        info!(rows = frame.len(), links = links.len(), skipped, "model pages parsed");
        Ok(frame)
    }

    async fn fetch_model_page<S: PageSession + ?Sized>(
        &self,
        session: &mut S,
        link: &ModelLink,
    ) -> Result<Option<RawFrame>, AdapterError> {
        let url = resolve_url(&link.date_url, &link.url);
        info!(url = %url, "loading model page");
        session
            .navigate(&url, self.config.page_load_timeout)
            .await?;
        // The first render never carries the data table.
        session.reload().await?;

        let model = if soft_wait(session, selectors::MODEL_HEADINGS, self.config.heading_timeout)
            .await?
        {
            let headings = session
                .locate_all(selectors::MODEL_HEADINGS)?
                .iter()
                .map(|h| extract_model_name(h.text_content()))
                .collect::<Vec<_>>();
            pick_model_name(&headings, &self.config.target_model)
        } else {
            warn!(url = %url, "model heading not found");
            String::new()
        };
        info!(model = %model, "model page loaded");

        if !soft_wait(session, selectors::RESULT_ROWS, self.config.table_timeout).await? {
            warn!(url = %url, "result table not found, skipping link");
            return Ok(None);
        }

        let rows = session.locate_all(selectors::RESULT_ROWS)?;
        let Some(mut frame) = parse_result_table(&rows) else {
            warn!(url = %url, "result table has no unit-number header, skipping link");
            return Ok(None);
        };
        debug!(rows = frame.len(), columns = ?frame.columns(), "result table parsed");

        frame.stamp("pref", &link.prefecture);
        frame.stamp("hall", &link.hall_name);
        frame.stamp("model", &model);
        frame.stamp("date", &link.date.format("%Y-%m-%d").to_string());
        Ok(Some(frame))
    }
}

async fn soft_wait<S: PageSession + ?Sized>(
    session: &mut S,
    selector: &str,
    timeout: Duration,
) -> Result<bool, AdapterError> {
    match session.wait_for_selector(selector, timeout).await {
        Ok(()) => Ok(true),
        Err(PageError::ElementTimeout(err)) => {
            debug!(%err, "element wait timed out");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn first_text<S: PageSession + ?Sized>(
    session: &S,
    selector: &str,
) -> Result<String, AdapterError> {
    Ok(session
        .locate_all(selector)?
        .first()
        .map(|e| normalize_text(Some(e.text_content())))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minrepo_storage::StaticPageSession;

    const HALL_URL: &str = "https://min-repo.test/tag/hall-a/";

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn navigator() -> MinRepoNavigator {
        MinRepoNavigator::new(NavigatorConfig {
            reference_date: reference(),
            ..Default::default()
        })
    }

    fn hall_page(labels: &[(&str, &str)]) -> String {
        let rows = labels
            .iter()
            .map(|(href, label)| format!(r#"<tr><td><a href="{href}">{label}</a></td></tr>"#))
            .collect::<String>();
        format!(
            r#"<html><body><div id="content">
                 <h1> ホールA </h1>
                 <div><span class="todofuken">東京都</span></div>
                 <div><table><tbody>{rows}</tbody></table></div>
               </div></body></html>"#
        )
    }

    fn date_page(links: &[(&str, &str)]) -> String {
        let rows = links
            .iter()
            .map(|(href, label)| format!(r#"<tr><td><a href="{href}">{label}</a></td></tr>"#))
            .collect::<String>();
        format!(
            r#"<html><body><h1>2024/3/5 ホールA</h1>
               <table class="kishu"><tbody>{rows}</tbody></table></body></html>"#
        )
    }

    fn model_page(heading: &str, rows: &[&[&str]]) -> String {
        let body = rows
            .iter()
            .map(|cells| {
                let tds = cells.iter().map(|c| format!("<td>{c}</td>")).collect::<String>();
                format!("<tr>{tds}</tr>")
            })
            .collect::<String>();
        format!(
            r#"<html><body>
                 <div class="tab_content"><h2>{heading}</h2></div>
                 <div><div class="table_wrap"><table><tbody>
                   <tr><th>台番</th><th>G数</th><th>差枚</th><th>BB</th><th>RB</th></tr>
                   {body}
                 </tbody></table></div></div>
               </body></html>"#
        )
    }

    fn model_link(url: &str) -> ModelLink {
        ModelLink {
            prefecture: "東京都".into(),
            hall_name: "ホールA".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            date_url: "https://min-repo.test/123/".into(),
            url: url.into(),
        }
    }

    #[test]
    fn normalize_text_trims_and_defaults() {
        assert_eq!(normalize_text(None), "");
        assert_eq!(normalize_text(Some("  東京都\n")), "東京都");
    }

    #[test]
    fn model_name_strips_listing_suffix_and_width() {
        assert_eq!(
            extract_model_name("ハッピージャグラーＶＩＩＩ　グラフ一覧"),
            "ハッピージャグラーVIII"
        );
        assert_eq!(extract_model_name("マイジャグラーV データ一覧 (全台)"), "マイジャグラーV");
        assert_eq!(extract_model_name("ＳアイムジャグラーＥＸ 一覧\n2ページ目"), "SアイムジャグラーEX");
        assert_eq!(extract_model_name("ゴーゴージャグラー3"), "ゴーゴージャグラー3");
        assert_eq!(extract_model_name(""), "");
    }

    #[test]
    fn model_name_extraction_is_idempotent() {
        for raw in [
            "ハッピージャグラーＶＩＩＩ　グラフ一覧",
            "  ファンキージャグラー２ＫＴ  ",
            "⼀覧のみ",
            "ジャグラーガールズＳＳ　データ一覧",
        ] {
            let once = extract_model_name(raw);
            assert_eq!(extract_model_name(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn date_labels_parse_with_and_without_year() {
        assert_eq!(
            parse_date_label("2024/3/5", reference()),
            Ok(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
        );
        assert_eq!(
            parse_date_label("3/5", reference()),
            Ok(NaiveDate::from_ymd_opt(2025, 3, 5).unwrap())
        );
        assert_eq!(
            parse_date_label("12/31(火)", reference()),
            Ok(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap())
        );
        assert_eq!(
            parse_date_label("３/５(火)", reference()),
            Ok(NaiveDate::from_ymd_opt(2025, 3, 5).unwrap())
        );
        assert_eq!(
            parse_date_label("２０２４/３/５", reference()),
            Ok(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
        );
        assert!(matches!(
            parse_date_label("13/40", reference()),
            Err(DateParseError::InvalidDate(_))
        ));
        assert!(matches!(
            parse_date_label("昨日", reference()),
            Err(DateParseError::Unrecognized(_))
        ));
    }

    #[test]
    fn model_name_prefers_target_heading() {
        let headings = vec!["データ".to_string(), "マイジャグラーV".to_string()];
        assert_eq!(pick_model_name(&headings, TARGET_MODEL), "マイジャグラーV");
        assert_eq!(pick_model_name(&headings[..1], TARGET_MODEL), "データ");
        assert_eq!(pick_model_name(&[], TARGET_MODEL), "");
    }

    #[tokio::test]
    async fn date_links_are_truncated_to_period() {
        let labels = [("/d/1/", "2024/3/7"), ("/d/2/", "3/6"), ("/d/3/", "3/5")];
        for (period, expected) in [(1u32, 1usize), (2, 2), (3, 3), (10, 3)] {
            let mut session = StaticPageSession::new().with_page(HALL_URL, hall_page(&labels));
            let links = navigator()
                .fetch_date_links(&mut session, HALL_URL, period)
                .await
                .expect("date links");
            assert_eq!(links.len(), expected, "period {period}");
        }
    }

    #[tokio::test]
    async fn date_links_carry_hall_context_and_absolute_urls() {
        let mut session = StaticPageSession::new()
            .with_page(HALL_URL, hall_page(&[("/d/1/", "2024/3/7"), ("/d/2/", "3/6")]));
        let links = navigator()
            .fetch_date_links(&mut session, HALL_URL, 2)
            .await
            .expect("date links");
        assert_eq!(links[0].hall_name, "ホールA");
        assert_eq!(links[0].prefecture, "東京都");
        assert_eq!(links[0].date, NaiveDate::from_ymd_opt(2024, 3, 7).unwrap());
        assert_eq!(links[0].url, "https://min-repo.test/d/1/");
        assert_eq!(links[1].date, NaiveDate::from_ymd_opt(2025, 3, 6).unwrap());
    }

    #[tokio::test]
    async fn invalid_date_labels_are_dropped_without_failing() {
        let mut session = StaticPageSession::new()
            .with_page(HALL_URL, hall_page(&[("/d/1/", "13/40"), ("/d/2/", "3/6")]));
        let links = navigator()
            .fetch_date_links(&mut session, HALL_URL, 2)
            .await
            .expect("date links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://min-repo.test/d/2/");
    }

    #[tokio::test]
    async fn hall_page_without_links_yields_empty_and_missing_names_are_blank() {
        let mut session = StaticPageSession::new()
            .with_page(HALL_URL, "<html><body><p>maintenance</p></body></html>");
        let links = navigator()
            .fetch_date_links(&mut session, HALL_URL, 3)
            .await
            .expect("soft failure");
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn unreachable_hall_page_is_a_navigation_error() {
        let mut session = StaticPageSession::new();
        let err = navigator()
            .fetch_date_links(&mut session, HALL_URL, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Navigation(_)));
    }

    #[tokio::test]
    async fn model_links_are_filtered_by_target_token() {
        let date_url = "https://min-repo.test/123/";
        let mut session = StaticPageSession::new().with_page(
            date_url,
            date_page(&[
                ("?kishu=1", "マイジャグラーV"),
                ("?kishu=2", "北斗の拳"),
                ("?kishu=3", "アイムジャグラーEX"),
                ("", "ファンキージャグラー2"),
            ]),
        );
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let links = navigator()
            .fetch_model_links(&mut session, "ホールA", "東京都", date_url, date)
            .await
            .expect("model links");
        assert_eq!(
            links.iter().map(|l| l.url.as_str()).collect::<Vec<_>>(),
            vec!["?kishu=1", "?kishu=3"]
        );
        assert_eq!(links[0].date_url, date_url);
    }

    #[tokio::test]
    async fn date_page_without_model_table_is_empty() {
        let date_url = "https://min-repo.test/123/";
        let mut session =
            StaticPageSession::new().with_page(date_url, "<html><body><h1>x</h1></body></html>");
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let links = navigator()
            .fetch_model_links(&mut session, "ホールA", "東京都", date_url, date)
            .await
            .expect("soft failure");
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn result_rows_exclude_average_and_require_reload() {
        let url = "https://min-repo.test/123/?kishu=1";
        let mut session = StaticPageSession::new()
            .with_first_render(
                url,
                "<html><body><div class=\"tab_content\"><h2>x</h2></div></body></html>",
            )
            .with_page(
                url,
                model_page(
                    "マイジャグラーＶ　グラフ一覧",
                    &[
                        &["101", "5,432", "+1,200", "20", "15"],
                        &["102", "3,001", "-800", "8", "9"],
                        &["平均", "4,216", "200", "14", "12"],
                        &["", "", "", "", ""],
                    ],
                ),
            );

        let frame = navigator()
            .fetch_result_rows(&mut session, &[model_link("?kishu=1")])
            .await
            .expect("rows");

        assert_eq!(session.reloads(), 1);
        assert_eq!(frame.len(), 2);
        for i in 0..frame.len() {
            assert!(!frame.get(i, UNIT_NO_COLUMN).unwrap_or_default().contains(AVERAGE_MARKER));
            assert_eq!(frame.get(i, "model"), Some("マイジャグラーV"));
            assert_eq!(frame.get(i, "pref"), Some("東京都"));
            assert_eq!(frame.get(i, "hall"), Some("ホールA"));
            assert_eq!(frame.get(i, "date"), Some("2024-03-05"));
        }
        assert_eq!(frame.get(0, "G数"), Some("5,432"));
        assert_eq!(frame.get(1, "差枚"), Some("-800"));
    }

    #[tokio::test]
    async fn missing_table_skips_only_that_link() {
        let bad = "https://min-repo.test/123/?kishu=1";
        let good = "https://min-repo.test/123/?kishu=2";
        let mut session = StaticPageSession::new()
            .with_page(
                bad,
                "<html><body><div class=\"tab_content\"><h2>マイジャグラーV</h2></div></body></html>",
            )
            .with_page(good, model_page("アイムジャグラーEX", &[&["201", "100", "0", "1", "0"]]));

        let frame = navigator()
            .fetch_result_rows(&mut session, &[model_link("?kishu=1"), model_link("?kishu=2")])
            .await
            .expect("rows");

        assert_eq!(frame.len(), 1);
        assert_eq!(frame.get(0, "model"), Some("アイムジャグラーEX"));
        assert_eq!(session.visits().len(), 2);
    }

    #[tokio::test]
    async fn missing_heading_leaves_model_blank() {
        let url = "https://min-repo.test/123/?kishu=1";
        let page = model_page("x", &[&["101", "10", "0", "0", "0"]])
            .replace("<div class=\"tab_content\"><h2>x</h2></div>", "");
        let mut session = StaticPageSession::new().with_page(url, page);
        let frame = navigator()
            .fetch_result_rows(&mut session, &[model_link("?kishu=1")])
            .await
            .expect("rows");
        assert_eq!(frame.get(0, "model"), Some(""));
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(parse_result_table(&[]).is_none());
    }
}
