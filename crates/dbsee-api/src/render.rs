//! Terminal rendering shared by the table and search commands.

use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use serde_json::Value;

use crate::stream::Record;

const MAX_CELL_WIDTH: usize = 48;

/// Renders a scalar the way a table cell should show it.
pub fn format_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "yes" } else { "no" }.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MAX_CELL_WIDTH - 1).collect();
    truncated.push('…');
    truncated
}

/// Column order: first appearance across the rows, so heterogeneous rows
/// still line up.
pub fn columns(rows: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

pub fn records_table(rows: &[Record]) -> Table {
    let columns = columns(rows);
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        columns
            .iter()
            .map(|c| Cell::new(c).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    for row in rows {
        table.add_row(
            columns
                .iter()
                .map(|c| Cell::new(truncate(&row.get(c).map(format_scalar).unwrap_or_default())))
                .collect::<Vec<_>>(),
        );
    }
    table
}

/// Two-column key/value table.
pub fn fields_table<'a>(fields: impl IntoIterator<Item = (&'a str, String)>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    for (key, value) in fields {
        table.add_row(vec![Cell::new(key).fg(Color::Cyan), Cell::new(value)]);
    }
    table
}
