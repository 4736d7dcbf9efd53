//! Terminal output helpers
//!
//! Human-readable output goes to stdout; `--json` output bypasses all of
//! this and prints one pretty JSON document.

use agentrix_types::MicroAmount;
use colored::*;

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", "━".repeat(60).bright_black());
    println!(" {}", title.bright_white().bold());
    println!("{}", "━".repeat(60).bright_black());
}

pub fn success(message: &str) {
    println!("  {} {}", "✓".bright_green(), message);
}

pub fn error(message: &str) {
    println!("  {} {}", "✗".bright_red(), message.bright_red());
}

/// Held or degraded, not failed
pub fn warning(message: &str) {
    println!("  {} {}", "⚠".yellow(), message.yellow());
}

/// Print an indented key-value pair
pub fn kv(key: &str, value: &str) {
    println!("      {}: {}", key, value.bright_cyan());
}

pub fn labeled(label: &str, value: &str) {
    println!("  {}: {}", label.bright_white(), value.bright_cyan());
}

/// Micro-units rendered as whole units, e.g. `1.250000`
pub fn units(amount: MicroAmount) -> String {
    match amount.to_decimal() {
        Ok(d) => format!("{:.6}", d),
        Err(_) => format!("{} micro", amount),
    }
}

/// First and last eight characters of a hash; shorter input is kept whole
///
/// Counts characters, not bytes: exported proofs are untrusted input.
pub fn short_hash(hash: &str) -> String {
    let count = hash.chars().count();
    if count <= 16 {
        return hash.to_string();
    }
    let head: String = hash.chars().take(8).collect();
    let tail: String = hash.chars().skip(count - 8).collect();
    format!("{}…{}", head, tail)
}

/// Pretty JSON for `--json` output
pub fn json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
