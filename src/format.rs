//! Rendering of output rows.

use crate::config::OutputFormat;
use crate::groupkeys::{escape_tsv, key_chain, GroupKeySet};

/// Integral values print without a fraction, others with at most seven
/// decimals and no trailing zeros.
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() };
    }
    if v == 0.0 {
        return "0".to_string();
    }
    if v.fract() == 0.0 {
        return format!("{:.0}", v);
    }
    let fixed = format!("{:.7}", v);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" { "0".to_string() } else { trimmed.to_string() }
}

/// One column per non-root stage of `group`'s ancestry.
pub fn group_columns(key_set: &dyn GroupKeySet, group: usize) -> Vec<String> {
    key_chain(key_set, group).iter().filter(|k| !k.is_initial()).map(|k| k.to_string()).collect()
}

pub fn term_column(term: &str) -> String {
    escape_tsv(term)
}

pub fn render_row(columns: &[String], format: OutputFormat) -> String {
    match format {
        OutputFormat::Tsv => columns.join("\t"),
        OutputFormat::Json => serde_json::to_string(columns).unwrap_or_default(),
    }
}

/// Group columns followed by formatted values.
pub fn stats_row(key_set: &dyn GroupKeySet, group: usize, values: &[f64], format: OutputFormat) -> String {
    let mut columns = group_columns(key_set, group);
    columns.extend(values.iter().map(|v| format_value(*v)));
    render_row(&columns, format)
}
