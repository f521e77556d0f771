//! `get_current_datetime`: current date and time in a few formats.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use contextloop_core::error::ToolError;
use contextloop_core::tool::{Tool, ToolOutput};

pub struct DateTimeTool;

/// Parse `UTC`, `Z`, `+HH:MM`, `-HH:MM` or `+HHMM`.
fn parse_offset(raw: &str) -> Result<FixedOffset, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| ToolError::InvalidArguments("bad offset".into()));
    }

    let invalid = || ToolError::InvalidArguments(format!("utc_offset must look like +05:30, got '{raw}'"));
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn render(now: DateTime<Utc>, offset: FixedOffset, format: &str) -> Result<String, ToolError> {
    let local = now.with_timezone(&offset);
    match format {
        "iso" => Ok(local.to_rfc3339()),
        "human" => Ok(local.format("%A, %B %-d, %Y at %H:%M:%S (UTC%:z)").to_string()),
        "timestamp" => Ok(now.timestamp().to_string()),
        other => Err(ToolError::InvalidArguments(format!(
            "format must be one of iso, human, timestamp; got '{other}'"
        ))),
    }
}

#[async_trait]
impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally at a fixed UTC offset."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "enum": ["iso", "human", "timestamp"],
                    "description": "Output format (default: iso)"
                },
                "utc_offset": {
                    "type": "string",
                    "description": "Offset such as +05:30 or -08:00 (default: UTC)"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let format = arguments["format"].as_str().unwrap_or("iso");
        let offset = parse_offset(arguments["utc_offset"].as_str().unwrap_or("UTC"))?;
        let now = Utc::now();
        let text = render(now, offset, format)?;
        Ok(ToolOutput::text(text).with_data(serde_json::json!({
            "unix": now.timestamp(),
            "utc_offset_seconds": offset.local_minus_utc(),
        })))
    }
}
