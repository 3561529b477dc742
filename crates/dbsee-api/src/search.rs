//! CIG and company search, one-shot and streaming.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenStore;
use crate::client::ApiClient;
use crate::config::ApiConfig;
use crate::render;
use crate::stream::{
    BroadSearch, Completed, DirectSearch, HttpTransport, Record, SearchObserver, SearchRequest,
    SearchVariant, Settlement, StreamConsumer, StreamError,
};

pub const MIN_CIG_LEN: usize = 3;
pub const MIN_COMPANY_LEN: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CigSearchResult {
    pub cig: String,
    pub found: bool,
    #[serde(default)]
    pub merged_data: Record,
    #[serde(default)]
    pub source_tables: Vec<String>,
    #[serde(default)]
    pub field_sources: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub total_fields: u32,
    #[serde(default)]
    pub tables_searched: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyResult {
    pub company_name: String,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_by_table: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggiudicatari_matches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggiudicatari_summary: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cig_details: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_filter: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_matches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_time: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablesWithCig {
    pub tables: Vec<String>,
    pub count: u32,
}

fn validated(value: &str, min_len: usize, what: &str) -> Result<String> {
    let value = value.trim();
    if value.chars().count() < min_len {
        anyhow::bail!("{} must be at least {} characters long", what, min_len);
    }
    Ok(value.to_string())
}

pub fn search_cig(client: &ApiClient, cig: &str) -> Result<CigSearchResult> {
    let cig = validated(cig, MIN_CIG_LEN, "CIG")?;
    client.get_with_query("search/cig", &[("cig", cig.as_str())], "CIG search")
}

pub fn search_company(client: &ApiClient, company_name: &str) -> Result<CompanyResult> {
    let company_name = validated(company_name, MIN_COMPANY_LEN, "Company name")?;
    client.get_with_query(
        "search/company",
        &[("company_name", company_name.as_str())],
        "company search",
    )
}

pub fn search_company_direct(
    client: &ApiClient,
    company_name: &str,
    year_filter: Option<i32>,
) -> Result<CompanyResult> {
    let company_name = validated(company_name, MIN_COMPANY_LEN, "Company name")?;
    let mut params = vec![("company_name", company_name)];
    if let Some(year) = year_filter {
        params.push(("year_filter", year.to_string()));
    }
    client.get_with_query("search/company-direct", &params, "direct company search")
}

pub fn tables_with_cig(client: &ApiClient) -> Result<TablesWithCig> {
    client.get("search/tables-with-cig", "CIG table list")
}

#[derive(Args, Debug)]
#[command(about = "Search procurement records")]
pub struct SearchArgs {
    #[command(subcommand)]
    command: SearchCommand,
}

#[derive(Subcommand, Debug)]
pub enum SearchCommand {
    /// Look up a CIG across every table that has one
    Cig {
        cig: String,

        #[arg(long)]
        json: bool,
    },
    /// Search records by company name
    Company {
        name: String,

        /// Only records from this year
        #[arg(short, long)]
        year: Option<i32>,

        /// Search the awardee table first and assemble CIG details
        #[arg(long)]
        direct: bool,

        /// Wait for the whole result instead of streaming progress
        #[arg(long)]
        no_stream: bool,

        #[arg(long)]
        json: bool,
    },
    /// List tables that contain a CIG column
    Tables,
}

pub fn execute(args: SearchArgs) -> Result<()> {
    match args.command {
        SearchCommand::Cig { cig, json } => {
            let client = ApiClient::new(ApiConfig::from_env(), TokenStore::from_env()?)?;
            let result = search_cig(&client, &cig)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_cig(&result);
            }
            Ok(())
        }
        SearchCommand::Company {
            name,
            year,
            direct,
            no_stream,
            json,
        } => {
            let name = validated(&name, MIN_COMPANY_LEN, "Company name")?;
            if no_stream {
                let client = ApiClient::new(ApiConfig::from_env(), TokenStore::from_env()?)?;
                let result = if direct {
                    search_company_direct(&client, &name, year)?
                } else {
                    search_company(&client, &name)?
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                } else {
                    print_company(&result);
                }
                return Ok(());
            }

            let request = SearchRequest::new(name, year);
            if direct {
                stream_company::<DirectSearch>(request, json)
            } else {
                stream_company::<BroadSearch>(request, json)
            }
        }
        SearchCommand::Tables => {
            let client = ApiClient::new(ApiConfig::from_env(), TokenStore::from_env()?)?;
            let result = tables_with_cig(&client)?;
            for table in &result.tables {
                println!("{}", table);
            }
            println!("{}", format!("{} tables with CIG", result.count).dimmed());
            Ok(())
        }
    }
}

fn stream_company<V>(request: SearchRequest, json: bool) -> Result<()>
where
    V: SearchVariant + StreamReport,
{
    let config = ApiConfig::from_env();
    let credential = TokenStore::from_env()?.token()?;
    let transport = Arc::new(HttpTransport::new(config.clone())?);
    let consumer = StreamConsumer::new(transport, config);

    let handle = consumer.spawn::<V, _>(request, credential, ProgressReporter::new(json));
    let canceller = handle.canceller();
    if let Err(e) = ctrlc::set_handler(move || canceller.cancel()) {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }

    let (settlement, reporter) = handle.join()?;
    reporter.finish(settlement)
}

/// How a search state shows up on the terminal while streaming and at the end.
pub trait StreamReport: Serialize + Sized {
    fn status_line(&self) -> String;

    /// One line per result received so far, in arrival order.
    fn result_lines(&self) -> Vec<String>;

    fn print_completed(completed: &Completed<Self>);
}

impl StreamReport for BroadSearch {
    fn status_line(&self) -> String {
        let position = match &self.progress {
            Some(p) => format!(
                "[{}/{}] {}{}",
                p.table_index,
                p.total_tables,
                p.current_table,
                if p.is_priority { " (priority)" } else { "" }
            ),
            None => self
                .status
                .clone()
                .unwrap_or_else(|| "Starting search...".to_string()),
        };
        format!("{} · {} matches", position, self.result.total_matches())
    }

    fn result_lines(&self) -> Vec<String> {
        self.result
            .per_table_results()
            .iter()
            .map(|t| format!("  {} {}: {} matches", "✓".green(), t.table_name, t.match_count))
            .collect()
    }

    fn print_completed(completed: &Completed<Self>) {
        let summary = &completed.summary;
        let result = &completed.state.result;
        println!(
            "{}",
            render::fields_table([
                ("Company", summary.company_name.clone()),
                (
                    "Year",
                    summary
                        .year_filter
                        .map(|y| y.to_string())
                        .unwrap_or_else(|| "all".to_string()),
                ),
                ("Found", if summary.found { "yes" } else { "no" }.to_string()),
                ("Total matches", summary.total_matches.to_string()),
                ("Tables searched", summary.tables_searched.to_string()),
                (
                    "Tables with results",
                    result.per_table_results().len().to_string(),
                ),
            ])
        );
        for table in result.per_table_results() {
            if table.rows.is_empty() {
                continue;
            }
            println!("\n{} ({} matches)", table.table_name.bold(), table.match_count);
            println!("{}", render::records_table(&table.rows));
        }
        for note in &completed.state.table_notes {
            println!(
                "{} {}: {}",
                "!".yellow(),
                note.table_name,
                note.reason.as_deref().unwrap_or("skipped")
            );
        }
    }
}

impl StreamReport for DirectSearch {
    fn status_line(&self) -> String {
        let status = self
            .status
            .clone()
            .unwrap_or_else(|| "Starting direct search...".to_string());
        match &self.cig_progress {
            Some(p) => format!("{} ({}/{})", status, p.processed, p.total),
            None => status,
        }
    }

    fn result_lines(&self) -> Vec<String> {
        let awardees = self.awardees.iter().map(|a| {
            format!(
                "  {} aggiudicatari_data: {} matches",
                "✓".green(),
                a.matches_found
            )
        });
        let details = self.cig_details.iter().map(|d| {
            format!(
                "  {} CIG {}",
                "✓".green(),
                d.cig.as_deref().unwrap_or("(unknown)")
            )
        });
        awardees.chain(details).collect()
    }

    fn print_completed(completed: &Completed<Self>) {
        let summary = &completed.summary;
        let state = &completed.state;
        println!(
            "{}",
            render::fields_table([
                ("Company", summary.company_name.clone()),
                ("Found", if summary.found { "yes" } else { "no" }.to_string()),
                (
                    "Awardee matches",
                    summary.aggiudicatari_matches.unwrap_or_default().to_string(),
                ),
                ("CIG details", state.cig_details.len().to_string()),
                (
                    "Search time",
                    summary
                        .search_time
                        .map(|t| format!("{:.2}s", t))
                        .unwrap_or_default(),
                ),
            ])
        );
        if let Some(awardees) = &state.awardees {
            if !awardees.data.is_empty() {
                println!("\n{}", "aggiudicatari_data".bold());
                println!("{}", render::records_table(&awardees.data));
            }
        }
        for miss in &state.cig_misses {
            println!(
                "{} CIG {}: {}",
                "!".yellow(),
                miss.cig,
                miss.error.as_deref().unwrap_or("no data")
            );
        }
    }
}

/// Terminal observer: a spinner for progress, one line per arriving result.
struct ProgressReporter<V> {
    spinner: ProgressBar,
    printed: usize,
    json: bool,
    outcome: Option<std::result::Result<Completed<V>, StreamError>>,
}

impl<V> ProgressReporter<V> {
    fn new(json: bool) -> Self {
        let spinner = if json {
            ProgressBar::hidden()
        } else {
            let spinner = ProgressBar::new_spinner();
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner.set_message(" Connecting...");
            spinner
        };
        Self {
            spinner,
            printed: 0,
            json,
            outcome: None,
        }
    }
}

impl<V: StreamReport> ProgressReporter<V> {
    fn finish(self, settlement: Settlement) -> Result<()> {
        match (settlement, self.outcome) {
            (Settlement::Completed, Some(Ok(completed))) => {
                if self.json {
                    let output = serde_json::json!({
                        "summary": completed.summary,
                        "result": completed.state,
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&output).context("Failed to serialize result")?
                    );
                } else {
                    println!("{}", "✓ Search complete".green().bold());
                    V::print_completed(&completed);
                }
                Ok(())
            }
            (Settlement::Cancelled, _) => {
                eprintln!("{}", "Search cancelled".yellow());
                Ok(())
            }
            (_, Some(Err(error))) => match error {
                StreamError::AuthRequired(_) | StreamError::AuthError(_) => anyhow::bail!(
                    "{}\nRun `dbsee auth login` to authenticate.",
                    error
                ),
                other => Err(other.into()),
            },
            (settlement, _) => anyhow::bail!("Search ended without a result ({:?})", settlement),
        }
    }
}

impl<V: StreamReport> SearchObserver<V> for ProgressReporter<V> {
    fn on_progress(&mut self, state: &V) {
        let lines = state.result_lines();
        for line in lines.iter().skip(self.printed) {
            if !self.json {
                self.spinner.println(line);
            }
        }
        self.printed = self.printed.max(lines.len());
        self.spinner.set_message(format!(" {}", state.status_line()));
    }

    fn on_complete(&mut self, completed: Completed<V>) {
        self.spinner.finish_and_clear();
        self.outcome = Some(Ok(completed));
    }

    fn on_error(&mut self, error: StreamError) {
        self.spinner.finish_and_clear();
        self.outcome = Some(Err(error));
    }
}

fn print_cig(result: &CigSearchResult) {
    if !result.found {
        println!(
            "{} CIG {} not found ({} tables searched)",
            "✗".red(),
            result.cig.bold(),
            result.tables_searched
        );
        return;
    }
    println!(
        "{} CIG {} found in {} of {} tables",
        "✓".green(),
        result.cig.bold(),
        result.source_tables.len(),
        result.tables_searched
    );
    let sources = result.field_sources.as_ref();
    println!(
        "{}",
        render::fields_table(result.merged_data.iter().map(|(key, value)| {
            let source = sources
                .and_then(|s| s.get(key))
                .map(render::format_scalar)
                .map(|table| format!("  [{}]", table))
                .unwrap_or_default();
            (key.as_str(), format!("{}{}", render::format_scalar(value), source))
        }))
    );
}

fn print_company(result: &CompanyResult) {
    if !result.found {
        println!("{} No records for {}", "✗".red(), result.company_name.bold());
        return;
    }
    println!(
        "{} {}: {} matches",
        "✓".green(),
        result.company_name.bold(),
        result
            .total_matches
            .or(result.aggiudicatari_matches)
            .unwrap_or_default()
    );
    if let Some(tables) = &result.results_by_table {
        for table in tables {
            let name = table
                .get("table_name")
                .map(render::format_scalar)
                .unwrap_or_default();
            let rows: Vec<Record> = table
                .get("data")
                .and_then(Value::as_array)
                .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
                .unwrap_or_default();
            println!("\n{} ({} rows)", name.bold(), rows.len());
            if !rows.is_empty() {
                println!("{}", render::records_table(&rows));
            }
        }
    }
    if let Some(summary) = &result.aggiudicatari_summary {
        if !summary.is_empty() {
            println!("\n{}", "aggiudicatari_data".bold());
            println!("{}", render::records_table(summary));
        }
    }
}
