//! Output formatting for CLI commands
//!
//! Reports print as JSON. Credential records print either as JSON or as
//! `KEY='value'` lines a shell entrypoint can `eval`.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::publisher::ServiceCredentials;
use crate::store::SecretFields;

/// Record output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RecordFormat {
    #[default]
    Json,
    Env,
}

/// Print data as JSON
pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

/// Print one credential record in the requested format
pub fn print_record(
    service: &ServiceCredentials,
    fields: &SecretFields,
    format: RecordFormat,
) -> Result<()> {
    match format {
        RecordFormat::Json => print_json(fields),
        RecordFormat::Env => {
            for line in env_lines(service, fields) {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

/// Render a record as `KEY='value'` lines.
///
/// Registered fields use the variable they were sourced from; any other
/// field is upper-cased.
pub fn env_lines(service: &ServiceCredentials, fields: &SecretFields) -> Vec<String> {
    fields
        .iter()
        .map(|(name, value)| {
            let key = service
                .fields
                .iter()
                .find(|f| &f.name == name)
                .map(|f| f.env_var.clone())
                .unwrap_or_else(|| name.to_ascii_uppercase());
            format!("{}={}", key, shell_quote(value))
        })
        .collect()
}

/// Single-quote `value` for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
