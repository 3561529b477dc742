use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ErrorKind, StreamError};

/// One row as the server sends it: column name to scalar, shape varies per table.
pub type Record = serde_json::Map<String, Value>;

/// A company search as submitted by the user. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    query: String,
    year_filter: Option<i32>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, year_filter: Option<i32>) -> Self {
        Self {
            query: query.into(),
            year_filter,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn year_filter(&self) -> Option<i32> {
        self.year_filter
    }
}

/// Terminal success frame (`final_summary`), shared by both search variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub company_name: String,
    #[serde(default)]
    pub year_filter: Option<i32>,
    pub found: bool,
    #[serde(default)]
    pub total_matches: u64,
    #[serde(default)]
    pub tables_searched: u32,
    #[serde(rename = "search_timestamp", default)]
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables_with_results: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_tables_searched: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggiudicatari_matches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_cigs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cig_details: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_time: Option<f64>,
}

/// Terminal failure frame (`error`, `auth_error`, `auth_required`).
#[derive(Debug, Clone, Deserialize)]
struct ErrorFrame {
    #[serde(rename = "type")]
    kind: ErrorKind,
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: Option<String>,
}

/// A decoded frame, classified as terminal or not before it reaches a reducer.
#[derive(Debug, Clone)]
pub enum Frame<U> {
    Update(U),
    Summary(FinalSummary),
    Failure(StreamError),
}

/// Decodes one `data:` payload. Terminal tags are recognised here so every
/// variant shares them; anything else is handed to the variant's update type.
pub fn decode_frame<U: DeserializeOwned>(payload: &str) -> Result<Frame<U>, StreamError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| StreamError::Parse(e.to_string()))?;

    let tag = value.get("type").and_then(Value::as_str).map(str::to_owned);
    let frame = match tag.as_deref() {
        Some("final_summary") => serde_json::from_value(value).map(Frame::Summary),
        Some("error" | "auth_error" | "auth_required") => {
            serde_json::from_value::<ErrorFrame>(value).map(|frame| {
                Frame::Failure(StreamError::from_wire(frame.kind, frame.message, frame.detail))
            })
        }
        Some(_) => serde_json::from_value(value).map(Frame::Update),
        None => return Err(StreamError::Parse("frame has no \"type\" field".to_string())),
    };

    frame.map_err(|e| match tag {
        Some(tag) => StreamError::Parse(format!("malformed {} frame: {}", tag, e)),
        None => StreamError::Parse(e.to_string()),
    })
}
