//! Output formatting for CLI commands: tables by default, JSON with --json.

use serde::Serialize;
use tabled::{Table, Tabled};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print rows as a table, or the source items as JSON
pub fn print_rows<'a, T: Serialize, R: Tabled>(
    items: &'a [T],
    to_row: impl Fn(&'a T) -> R,
    mode: OutputMode,
) -> Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                let rows: Vec<R> = items.iter().map(to_row).collect();
                println!("{}", Table::new(rows));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

/// Print a single item as pretty JSON in either mode
pub fn print_item<T: Serialize>(item: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

pub fn print_kv(key: &str, value: impl std::fmt::Display) {
    println!("{key:<16} {value}");
}

pub fn print_success(msg: &str) {
    println!("\x1b[32m{msg}\x1b[0m");
}

pub fn print_warn(msg: &str) {
    println!("\x1b[33m{msg}\x1b[0m");
}

pub fn print_error(msg: &str) {
    eprintln!("\x1b[31m{msg}\x1b[0m");
}
