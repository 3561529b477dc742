//! Table browsing: schema inspection and paginated data.

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::TokenStore;
use crate::client::ApiClient;
use crate::config::ApiConfig;
use crate::render;
use crate::stream::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub autoincrement: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub constrained_columns: Vec<String>,
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OrderDir {
    #[default]
    Asc,
    Desc,
}

impl OrderDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Body of `POST /tables/{name}/query`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    pub page: u32,
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    pub order_dir: OrderDir,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            filters: None,
            search: None,
            page: 1,
            page_size: 20,
            order_by: None,
            order_dir: OrderDir::Asc,
        }
    }
}

impl QueryFilters {
    /// Query string for `GET /tables/{name}/data`; column filters only go in the POST body.
    pub fn data_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("page", self.page.to_string()),
            ("page_size", self.page_size.to_string()),
            ("order_dir", self.order_dir.as_str().to_string()),
        ];
        if let Some(search) = self.search.as_ref().filter(|s| !s.is_empty()) {
            params.push(("search", search.clone()));
        }
        if let Some(order_by) = &self.order_by {
            params.push(("order_by", order_by.clone()));
        }
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInfo {
    pub table_name: String,
    pub filters_applied: bool,
    pub search_applied: bool,
    pub order_by: Option<String>,
    pub order_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<Record>,
    pub pagination: PaginationInfo,
    pub query_info: QueryInfo,
}

fn table_path(table_name: &str, suffix: &str) -> Result<String> {
    let name = table_name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("Invalid table name: {:?}", table_name);
    }
    Ok(format!("tables/{}/{}", name, suffix))
}

pub fn list_tables(client: &ApiClient) -> Result<Vec<String>> {
    client.get("tables/", "table list")
}

pub fn table_schema(client: &ApiClient, table_name: &str) -> Result<TableSchema> {
    client.get(&table_path(table_name, "schema")?, "table schema")
}

pub fn query_table(client: &ApiClient, table_name: &str, filters: &QueryFilters) -> Result<QueryResult> {
    client.post(&table_path(table_name, "query")?, filters, "table query")
}

pub fn table_data(client: &ApiClient, table_name: &str, filters: &QueryFilters) -> Result<QueryResult> {
    client.get_with_query(
        &table_path(table_name, "data")?,
        &filters.data_params(),
        "table data",
    )
}

#[derive(Args, Debug)]
#[command(about = "Browse database tables")]
pub struct TablesArgs {
    #[command(subcommand)]
    command: TablesCommand,
}

#[derive(Subcommand, Debug)]
pub enum TablesCommand {
    /// List available tables
    List,
    /// Show columns, keys and indexes of a table
    Schema { table: String },
    /// Show one page of table rows
    Show {
        table: String,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=1000))]
        page_size: u32,

        /// Free-text search across the table's text columns
        #[arg(short, long)]
        search: Option<String>,

        #[arg(long)]
        order_by: Option<String>,

        #[arg(long, value_enum, default_value_t = OrderDir::Asc)]
        order_dir: OrderDir,

        /// Column filter as column=value (repeatable); switches to a filtered query
        #[arg(short = 'f', long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
}

fn parse_filter(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((column, value)) if !column.trim().is_empty() => {
            Ok((column.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected column=value, got {:?}", raw)),
    }
}

pub fn execute(args: TablesArgs) -> Result<()> {
    let client = ApiClient::new(ApiConfig::from_env(), TokenStore::from_env()?)?;

    match args.command {
        TablesCommand::List => {
            let tables = list_tables(&client)?;
            for table in &tables {
                println!("{}", table);
            }
            println!("{}", format!("{} tables", tables.len()).dimmed());
        }
        TablesCommand::Schema { table } => {
            let schema = table_schema(&client, &table)?;
            print_schema(&schema);
        }
        TablesCommand::Show {
            table,
            page,
            page_size,
            search,
            order_by,
            order_dir,
            filters,
            json,
        } => {
            let query = QueryFilters {
                filters: (!filters.is_empty()).then(|| {
                    filters
                        .into_iter()
                        .map(|(column, value)| (column, Value::String(value)))
                        .collect()
                }),
                search,
                page,
                page_size,
                order_by,
                order_dir,
            };
            let result = if query.filters.is_some() {
                query_table(&client, &table, &query)?
            } else {
                table_data(&client, &table, &query)?
            };

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).context("Failed to serialize rows")?
                );
                return Ok(());
            }
            print_page(&result);
        }
    }
    Ok(())
}

fn print_schema(schema: &TableSchema) {
    println!("{}", schema.table_name.bold());

    let mut columns = comfy_table::Table::new();
    columns.load_preset(comfy_table::presets::UTF8_FULL_CONDENSED);
    columns.set_header(vec!["Column", "Type", "Nullable", "Default", "Key"]);
    for column in &schema.columns {
        let key = if schema.primary_keys.contains(&column.name) {
            "PK"
        } else {
            ""
        };
        columns.add_row(vec![
            column.name.clone(),
            column.column_type.clone(),
            if column.nullable { "yes" } else { "no" }.to_string(),
            render::format_scalar(&column.default),
            key.to_string(),
        ]);
    }
    println!("{columns}");

    for fk in &schema.foreign_keys {
        println!(
            "  FK ({}) -> {}({})",
            fk.constrained_columns.join(", "),
            fk.referred_table,
            fk.referred_columns.join(", ")
        );
    }
    for index in &schema.indexes {
        println!(
            "  {} {} ({})",
            if index.unique { "UNIQUE" } else { "INDEX" },
            index.name.as_deref().unwrap_or("-"),
            index.columns.join(", ")
        );
    }
}

fn print_page(result: &QueryResult) {
    if result.data.is_empty() {
        println!("{}", "No rows".yellow());
    } else {
        println!("{}", render::records_table(&result.data));
    }
    let p = &result.pagination;
    println!(
        "{}",
        format!(
            "Page {}/{} · {} rows total{}",
            p.page,
            p.total_pages.max(1),
            p.total_items,
            if result.query_info.search_applied {
                " · search applied"
            } else {
                ""
            }
        )
        .dimmed()
    );
}
