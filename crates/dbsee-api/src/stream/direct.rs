//! Direct company search: the awardee table (`aggiudicatari_data`) is queried
//! first, then full details for each matching CIG are streamed one by one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::consumer::SearchVariant;
use super::event::{FinalSummary, Record, SearchRequest};
use crate::config::ApiConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardeeSummary {
    pub matches_found: u64,
    #[serde(default)]
    pub search_time: f64,
    #[serde(default)]
    pub data: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CigProgress {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cig: Option<String>,
    #[serde(alias = "progress")]
    pub processed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CigDetail {
    #[serde(default)]
    pub cig: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CigMiss {
    pub cig: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectUpdate {
    SearchStarted {
        company_name: String,
        #[serde(default)]
        year_filter: Option<i32>,
    },
    Progress {
        message: String,
        #[serde(default)]
        step: Option<u32>,
    },
    AggiudicatariResults(AwardeeSummary),
    CigProgress(CigProgress),
    CigDetail(CigDetail),
    CigNoData {
        cig: String,
    },
    CigError {
        cig: String,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirectSearch {
    pub company_name: String,
    pub year_filter: Option<i32>,
    pub status: Option<String>,
    pub step: Option<u32>,
    /// Set by the first `aggiudicatari_results` frame only.
    pub awardees: Option<AwardeeSummary>,
    pub cig_progress: Option<CigProgress>,
    pub cig_details: Vec<CigDetail>,
    pub cig_misses: Vec<CigMiss>,
    pub found: bool,
}

impl SearchVariant for DirectSearch {
    type Update = DirectUpdate;

    const ENDPOINT: &'static str = "company-direct-stream";

    fn timeout(config: &ApiConfig) -> Duration {
        config.direct_search_timeout
    }

    fn begin(&mut self, request: &SearchRequest) {
        *self = Self {
            company_name: request.query().to_string(),
            year_filter: request.year_filter(),
            ..Default::default()
        };
    }

    fn apply(&mut self, update: DirectUpdate) {
        match update {
            DirectUpdate::SearchStarted {
                company_name,
                year_filter,
            } => {
                self.status = Some(format!("Searching {}", company_name));
                self.company_name = company_name;
                self.year_filter = year_filter;
            }
            DirectUpdate::Progress { message, step } => {
                self.status = Some(message);
                self.step = step.or(self.step);
            }
            DirectUpdate::AggiudicatariResults(summary) => {
                if self.awardees.is_some() {
                    log::warn!("Ignoring repeated aggiudicatari_results frame");
                    return;
                }
                self.status = Some(format!(
                    "Found {} matches in aggiudicatari_data",
                    summary.matches_found
                ));
                self.found = summary.matches_found > 0;
                self.awardees = Some(summary);
            }
            DirectUpdate::CigProgress(progress) => {
                self.status = Some(progress.message.clone());
                self.cig_progress = Some(progress);
            }
            DirectUpdate::CigDetail(detail) => self.cig_details.push(detail),
            DirectUpdate::CigNoData { cig } => self.cig_misses.push(CigMiss { cig, error: None }),
            DirectUpdate::CigError { cig, error } => {
                log::warn!("Server failed assembling CIG {}: {:?}", cig, error);
                self.cig_misses.push(CigMiss { cig, error });
            }
            DirectUpdate::Other => {}
        }
    }

    fn finish(&mut self, summary: &FinalSummary) {
        self.found = summary.found;
        self.status = None;
    }
}
