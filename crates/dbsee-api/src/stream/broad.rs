//! Broad company search: every table containing company columns is scanned,
//! priority tables first, and each table with hits is streamed as soon as it
//! is done.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::consumer::SearchVariant;
use super::event::{FinalSummary, Record, SearchRequest};
use crate::config::ApiConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProgress {
    pub current_table: String,
    pub table_index: u32,
    pub total_tables: u32,
    #[serde(default)]
    pub is_priority: bool,
    #[serde(rename = "priority_tables", default)]
    pub priority_total: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableResult {
    pub table_name: String,
    #[serde(rename = "matches")]
    pub match_count: u64,
    #[serde(rename = "data", default)]
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableNote {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadUpdate {
    Progress(TableProgress),
    Status {
        message: String,
    },
    TableResult(TableResult),
    TablesCount {
        total_tables: u32,
        #[serde(default)]
        priority_tables: Option<u32>,
    },
    TableNoResults {
        table_name: String,
    },
    TableSkipped {
        table_name: String,
        #[serde(default)]
        reason: Option<String>,
    },
    TableError {
        table_name: String,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Search-result aggregate. `total_matches` is always the sum of the match
/// counts in `per_table_results`, which keep arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccumulatedResult {
    query: String,
    year_filter: Option<i32>,
    found: bool,
    per_table_results: Vec<TableResult>,
    total_matches: u64,
}

impl AccumulatedResult {
    pub fn new(query: impl Into<String>, year_filter: Option<i32>) -> Self {
        Self {
            query: query.into(),
            year_filter,
            ..Default::default()
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn year_filter(&self) -> Option<i32> {
        self.year_filter
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn per_table_results(&self) -> &[TableResult] {
        &self.per_table_results
    }

    pub fn total_matches(&self) -> u64 {
        self.total_matches
    }

    /// Appends without deduplication: a table reported twice counts twice.
    pub fn push(&mut self, table: TableResult) {
        self.total_matches += table.match_count;
        self.found = self.total_matches > 0;
        self.per_table_results.push(table);
    }

    fn merge_summary(&mut self, summary: &FinalSummary) {
        self.found = summary.found;
        if summary.total_matches != self.total_matches {
            log::warn!(
                "Server reported {} total matches, {} were streamed",
                summary.total_matches,
                self.total_matches
            );
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadSearch {
    pub result: AccumulatedResult,
    /// Progress indicator, kept apart from the result.
    pub progress: Option<TableProgress>,
    pub status: Option<String>,
    pub total_tables: Option<u32>,
    pub tables_without_results: Vec<String>,
    /// Tables the server skipped or failed on.
    pub table_notes: Vec<TableNote>,
}

impl SearchVariant for BroadSearch {
    type Update = BroadUpdate;

    const ENDPOINT: &'static str = "company-stream";

    fn timeout(config: &ApiConfig) -> Duration {
        config.broad_search_timeout
    }

    fn begin(&mut self, request: &SearchRequest) {
        *self = Self {
            result: AccumulatedResult::new(request.query(), request.year_filter()),
            ..Default::default()
        };
    }

    fn apply(&mut self, update: BroadUpdate) {
        match update {
            BroadUpdate::TableResult(table) => self.result.push(table),
            BroadUpdate::Progress(progress) => {
                self.total_tables = Some(progress.total_tables);
                self.progress = Some(progress);
            }
            BroadUpdate::Status { message } => self.status = Some(message),
            BroadUpdate::TablesCount { total_tables, .. } => self.total_tables = Some(total_tables),
            BroadUpdate::TableNoResults { table_name } => {
                self.tables_without_results.push(table_name)
            }
            BroadUpdate::TableSkipped { table_name, reason } => {
                self.table_notes.push(TableNote { table_name, reason })
            }
            BroadUpdate::TableError { table_name, error } => {
                log::warn!("Server failed searching {}: {:?}", table_name, error);
                self.table_notes.push(TableNote {
                    table_name,
                    reason: error,
                });
            }
            BroadUpdate::Other => {}
        }
    }

    fn finish(&mut self, summary: &FinalSummary) {
        self.result.merge_summary(summary);
        self.progress = None;
        self.status = None;
    }
}
