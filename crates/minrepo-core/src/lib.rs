//! Core domain model for the min-repo result collector.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "minrepo-core";

/// One configured hall: the URL slug plus how many recent days to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HallTarget {
    pub slug: String,
    pub period: u32,
}

/// Top-level shape of the hall list file (`halls:` list).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HallRegistry {
    #[serde(default)]
    pub halls: Vec<HallTarget>,
}

/// A per-day result page found on a hall's landing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateLink {
    pub prefecture: String,
    pub hall_name: String,
    pub date: NaiveDate,
    pub url: String,
}

/// A model sub-page found on a per-day page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLink {
    pub prefecture: String,
    pub hall_name: String,
    pub date: NaiveDate,
    pub date_url: String,
    pub url: String,
}

/// Cleaned per-unit result. Field names double as the cleaned CSV header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub pref: String,
    pub hall: String,
    pub model: String,
    pub date: NaiveDate,
    pub unit_no: i64,
    pub game: i64,
    pub bb: i64,
    pub rb: i64,
    pub medal: i64,
}

/// Counts of rows that did not exist before a sink load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub new_prefectures: u64,
    pub new_halls: u64,
    pub new_models: u64,
    pub new_results: u64,
    pub skipped_rows: u64,
}

/// Column-labelled table of raw cell text as scraped from the site.
///
/// Columns keep first-seen order. Every row is exactly as wide as the column
/// list; absent cells are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RawFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Appends a row, padding short rows with `None` and dropping surplus cells.
    pub fn push_row(&mut self, mut row: Vec<Option<String>>) {
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[String], &[Option<String>]) -> bool,
    {
        let columns = &self.columns;
        self.rows.retain(|row| keep(columns, row));
    }

    /// Sets `column` to `value` on every row, adding the column if needed.
    pub fn stamp(&mut self, column: &str, value: &str) {
        let idx = match self.column_index(column) {
            Some(idx) => idx,
            None => {
                self.columns.push(column.to_string());
                for row in &mut self.rows {
                    row.push(None);
                }
                self.columns.len() - 1
            }
        };
        for row in &mut self.rows {
            row[idx] = Some(value.to_string());
        }
    }

    /// Renames columns found in `renames`; unknown labels are left as-is.
    pub fn rename_columns(&mut self, renames: &BTreeMap<String, String>) {
        for column in &mut self.columns {
            if let Some(target) = renames.get(column.as_str()) {
                *column = target.clone();
            }
        }
    }

    /// Projects onto `columns` in that order; missing columns become all-`None`.
    pub fn select(&self, columns: &[&str]) -> RawFrame {
        let indices = columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Vec<_>>();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| idx.and_then(|i| row[i].clone()))
                    .collect()
            })
            .collect();
        RawFrame {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    /// Row-wise concatenation over the union of all column labels.
    pub fn concat(frames: impl IntoIterator<Item = RawFrame>) -> RawFrame {
        let mut out = RawFrame::default();
        for frame in frames {
            for column in &frame.columns {
                if out.column_index(column).is_none() {
                    out.columns.push(column.clone());
                    for row in &mut out.rows {
                        row.push(None);
                    }
                }
            }
            let indices = frame
                .columns
                .iter()
                .map(|c| out.column_index(c).unwrap_or_default())
                .collect::<Vec<_>>();
            for row in frame.rows {
                let mut aligned = vec![None; out.columns.len()];
                for (cell, idx) in row.into_iter().zip(&indices) {
                    aligned[*idx] = cell;
                }
                out.rows.push(aligned);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(columns: &[&str], rows: &[&[&str]]) -> RawFrame {
        let mut f = RawFrame::new(columns.iter().map(|c| c.to_string()).collect());
        for row in rows {
            f.push_row(row.iter().map(|c| Some(c.to_string())).collect());
        }
        f
    }

    #[test]
    fn push_row_pads_and_truncates_to_header_width() {
        let mut f = RawFrame::new(vec!["a".into(), "b".into()]);
        f.push_row(vec![Some("1".into())]);
        f.push_row(vec![Some("1".into()), Some("2".into()), Some("3".into())]);
        assert_eq!(f.rows()[0], vec![Some("1".to_string()), None]);
        assert_eq!(f.rows()[1].len(), 2);
    }

    #[test]
    fn stamp_adds_constant_column() {
        let mut f = frame(&["台番"], &[&["101"], &["102"]]);
        f.stamp("hall", "ホールA");
        assert_eq!(f.columns(), &["台番".to_string(), "hall".to_string()]);
        assert_eq!(f.get(1, "hall"), Some("ホールA"));
    }

    #[test]
    fn concat_aligns_columns_by_label() {
        let a = frame(&["x", "y"], &[&["1", "2"]]);
        let b = frame(&["y", "z"], &[&["3", "4"]]);
        let c = RawFrame::concat([a, b]);
        assert_eq!(c.columns(), &["x".to_string(), "y".to_string(), "z".to_string()]);
        assert_eq!(c.get(0, "z"), None);
        assert_eq!(c.get(1, "x"), None);
        assert_eq!(c.get(1, "y"), Some("3"));
    }

    #[test]
    fn select_synthesizes_missing_columns() {
        let f = frame(&["b", "a"], &[&["2", "1"]]);
        let s = f.select(&["a", "b", "c"]);
        assert_eq!(s.rows()[0], vec![Some("1".to_string()), Some("2".to_string()), None]);
    }
}
