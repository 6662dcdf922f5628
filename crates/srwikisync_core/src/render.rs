use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_TEMPLATE;
use crate::matcher::ResolvedRow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    #[default]
    Clock,
    Units,
}

#[derive(Debug, Clone)]
pub struct RowRenderer {
    template: String,
    time_format: TimeFormat,
}

impl Default for RowRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE, TimeFormat::default())
    }
}

impl RowRenderer {
    pub fn new(template: &str, time_format: TimeFormat) -> Self {
        Self {
            template: template.to_string(),
            time_format,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render one row, or `None` when there is no qualifying run.
    pub fn render(&self, resolved: &ResolvedRow<'_>) -> Option<String> {
        let run = resolved.record()?;
        Some(format!(
            "{{{{{}|{}|{}|{}|{}}}}}",
            self.template,
            resolved.entry.wiki_category_label,
            escape_parameter(&run.player),
            format_time(run.time_seconds, self.time_format),
            format_date(run.date),
        ))
    }

    /// Placeholder row to paste into a section that lacks a declared label.
    pub fn scaffold(&self, label: &str) -> String {
        format!(
            "{{{{{}|{label}|<player>|<time>|<date>}}}}",
            self.template
        )
    }
}

/// `clock` drops leading zero hour and minute groups (`1:39.000`, `9.500`).
/// `units` writes `1h 2m 3s 450ms`, omitting zero leading groups and zero ms.
/// Both round to the millisecond first.
pub fn format_time(seconds: f64, format: TimeFormat) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let m = (total_s / 60) % 60;
    let h = total_s / 3600;

    match format {
        TimeFormat::Clock => {
            if h > 0 {
                format!("{h}:{m:02}:{s:02}.{ms:03}")
            } else if m > 0 {
                format!("{m}:{s:02}.{ms:03}")
            } else {
                format!("{s}.{ms:03}")
            }
        }
        TimeFormat::Units => {
            let mut parts = Vec::with_capacity(4);
            if h > 0 {
                parts.push(format!("{h}h"));
            }
            if h > 0 || m > 0 {
                parts.push(format!("{m}m"));
            }
            parts.push(format!("{s}s"));
            if ms > 0 {
                parts.push(format!("{ms}ms"));
            }
            parts.join(" ")
        }
    }
}

/// `2021-03-04` -> `March 4, 2021`; undated runs render empty.
pub fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|date| date.format("%B %-d, %Y").to_string())
        .unwrap_or_default()
}

/// A literal pipe would split the template parameter.
fn escape_parameter(value: &str) -> String {
    value.replace('|', "{{!}}")
}
