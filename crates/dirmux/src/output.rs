use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dirmux_client::UnsolicitedNotice;
use dirmux_frame::LdapResult;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Outcome of one operation, as printed by `bind` and `extended`.
#[derive(Serialize)]
pub struct ResultOutput {
    pub schema_id: &'static str,
    pub host: String,
    pub port: u16,
    pub operation: &'static str,
    pub message_id: i32,
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<(String, String)>,
}

impl ResultOutput {
    pub fn new(
        schema: &'static str,
        host: &str,
        port: u16,
        operation: &'static str,
        message_id: i32,
        result: &LdapResult,
    ) -> Self {
        Self {
            schema_id: schema,
            host: host.to_string(),
            port,
            operation,
            message_id,
            result_code: result.result_code,
            matched_dn: result.matched_dn.clone(),
            diagnostic_message: result.diagnostic_message.clone(),
            referrals: result.referrals.clone(),
            details: Vec::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.push((key.to_string(), value.into()));
        self
    }
}

pub fn print_result(out: &ResultOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut rows = vec![
                vec!["operation".to_string(), out.operation.to_string()],
                vec!["server".to_string(), format!("{}:{}", out.host, out.port)],
                vec!["message id".to_string(), out.message_id.to_string()],
                vec!["result code".to_string(), out.result_code.to_string()],
                vec!["diagnostic".to_string(), out.diagnostic_message.clone()],
            ];
            if !out.matched_dn.is_empty() {
                rows.push(vec!["matched dn".to_string(), out.matched_dn.clone()]);
            }
            for url in &out.referrals {
                rows.push(vec!["referral".to_string(), url.clone()]);
            }
            for (key, value) in &out.details {
                rows.push(vec![key.clone(), value.clone()]);
            }
            print_table(vec!["FIELD", "VALUE"], rows);
        }
        OutputFormat::Pretty => {
            println!(
                "{} on {}:{} (msg {}): result={} {}",
                out.operation,
                out.host,
                out.port,
                out.message_id,
                out.result_code,
                out.diagnostic_message
            );
            for url in &out.referrals {
                println!("  referral: {url}");
            }
            for (key, value) in &out.details {
                println!("  {key}: {value}");
            }
        }
    }
}

#[derive(Serialize)]
struct NoticeOutput<'a> {
    schema_id: &'a str,
    connection: &'a str,
    oid: Option<&'a str>,
    result_code: i32,
    diagnostic_message: &'a str,
    value: Option<String>,
    disconnect: bool,
    timestamp: String,
}

pub fn print_notice(notice: &UnsolicitedNotice, connection: &str, format: OutputFormat) {
    let value = notice.value.as_deref().map(value_preview);
    match format {
        OutputFormat::Json => print_json(&NoticeOutput {
            schema_id: "https://schemas.3leaps.dev/dirmux/cli/v1/unsolicited-notice.schema.json",
            connection,
            oid: notice.oid.as_deref(),
            result_code: notice.result_code,
            diagnostic_message: &notice.diagnostic_message,
            value,
            disconnect: notice.is_notice_of_disconnection(),
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => print_table(
            vec!["OID", "CODE", "MESSAGE", "VALUE"],
            vec![vec![
                notice.oid.clone().unwrap_or_else(|| "-".to_string()),
                notice.result_code.to_string(),
                notice.diagnostic_message.clone(),
                value.unwrap_or_default(),
            ]],
        ),
        OutputFormat::Pretty => {
            println!(
                "notice oid={} code={} message={} value={}",
                notice.oid.as_deref().unwrap_or("-"),
                notice.result_code,
                notice.diagnostic_message,
                value.as_deref().unwrap_or("-")
            );
        }
    }
}

/// Printable form of a protocol value: text when it is UTF-8.
pub fn value_preview(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", value.len()),
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_table(header: Vec<&str>, rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
