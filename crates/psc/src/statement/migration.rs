//! Migration file parsing.
//!
//! A migration is a `.sql` file whose head comment lines carry `-- psc:`
//! directives:
//!
//! ```sql
//! -- psc: migrate name=backfill_totals
//! -- psc: target service=orders
//! -- psc: batch column=id chunk=50000 parallelism=4
//! -- psc: on_error continue
//! -- psc: timeout 90s
//! UPDATE orders SET total = subtotal + tax
//! WHERE id BETWEEN :start AND :end AND total IS NULL;
//! ```
//!
//! Without a `batch` directive the SQL runs as a single statement and the
//! chunk engine is not used.

use crate::error::{PscError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directive prefix on comment lines.
const DIRECTIVE_PREFIX: &str = "-- psc:";

/// Default rows per chunk for batched migrations.
pub const DEFAULT_CHUNK_SIZE: i64 = 10_000;

/// What to do when a chunk fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// First error cancels the operation (default).
    #[default]
    Abort,
    /// Record the error and move on to the next chunk.
    Continue,
}

/// A parsed SQL migration file.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique migration name (required).
    pub name: String,

    /// Path the migration was parsed from.
    pub filename: PathBuf,

    /// The SQL body with directive lines stripped.
    pub sql: String,

    /// Target service name; falls back to the CLI default when absent.
    pub service: Option<String>,

    /// Key column for batching; absent means non-batched.
    pub batch_column: Option<String>,

    /// Rows per chunk.
    pub chunk_size: i64,

    /// Worker count.
    pub parallelism: usize,

    /// Chunk failure policy.
    pub on_error: OnError,

    /// Per-chunk execution timeout.
    pub timeout: Option<Duration>,
}

impl Migration {
    /// Whether this migration uses the chunk engine.
    pub fn is_batched(&self) -> bool {
        self.batch_column.is_some()
    }
}

/// Parse a migration file from disk.
pub fn parse_migration_file(path: impl AsRef<Path>) -> Result<Migration> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        PscError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_migration(&content, path)
}

/// Parse migration content, attributing errors to `path`.
pub fn parse_migration(content: &str, path: &Path) -> Result<Migration> {
    let mut migration = Migration {
        name: String::new(),
        filename: path.to_path_buf(),
        sql: String::new(),
        service: None,
        batch_column: None,
        chunk_size: DEFAULT_CHUNK_SIZE,
        parallelism: 1,
        on_error: OnError::Abort,
        timeout: None,
    };

    let mut sql_lines: Vec<&str> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(directive) = trimmed.strip_prefix(DIRECTIVE_PREFIX) {
            parse_directive(&mut migration, directive)
                .map_err(|e| PscError::Config(format!("{}: {}", path.display(), e)))?;
        } else {
            sql_lines.push(line);
        }
    }
    migration.sql = sql_lines.join("\n").trim().to_string();

    if migration.name.is_empty() {
        return Err(PscError::Config(format!(
            "{}: missing required 'psc: migrate name=<name>' directive",
            path.display()
        )));
    }
    Ok(migration)
}

fn parse_directive(migration: &mut Migration, directive: &str) -> std::result::Result<(), String> {
    let parts: Vec<&str> = directive.split_whitespace().collect();
    let Some((&keyword, rest)) = parts.split_first() else {
        return Ok(());
    };

    match keyword {
        "migrate" => {
            if let Some(name) = parse_kv(rest).remove("name") {
                migration.name = name;
            }
        }
        "target" => {
            if let Some(service) = parse_kv(rest).remove("service") {
                migration.service = Some(service);
            }
        }
        "batch" => {
            let mut kv = parse_kv(rest);
            if let Some(column) = kv.remove("column") {
                migration.batch_column = Some(column);
            }
            if let Some(chunk) = kv.remove("chunk") {
                migration.chunk_size = chunk
                    .parse()
                    .map_err(|_| format!("invalid chunk size '{}'", chunk))?;
            }
            if let Some(parallelism) = kv.remove("parallelism") {
                migration.parallelism = parallelism
                    .parse()
                    .map_err(|_| format!("invalid parallelism '{}'", parallelism))?;
            }
        }
        "on_error" => match rest.first() {
            Some(&"continue") => migration.on_error = OnError::Continue,
            Some(&"abort") => migration.on_error = OnError::Abort,
            other => {
                return Err(format!(
                    "invalid on_error policy '{}' (expected abort or continue)",
                    other.unwrap_or(&"")
                ))
            }
        },
        "timeout" => match rest.first() {
            Some(value) => {
                migration.timeout =
                    Some(parse_duration(value).map_err(|e| format!("invalid timeout: {}", e))?);
            }
            None => return Err("timeout directive needs a duration".to_string()),
        },
        _ => {} // unknown directives ignored
    }
    Ok(())
}

fn parse_kv(parts: &[&str]) -> std::collections::HashMap<String, String> {
    let mut kv = std::collections::HashMap::new();
    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            if !key.is_empty() {
                kv.insert(key.to_string(), value.to_string());
            }
        }
    }
    kv
}

/// Parse a compound duration like `90s`, `1h30m`, or `500ms`.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`. Fractions are allowed (`1.5h`).
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in '{}'", input))?;
        if number_len == 0 {
            return Err(format!("expected a number in '{}'", input));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("bad number in '{}'", input))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let unit_secs = match unit {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit '{}' in '{}'", unit, input)),
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }
    Ok(total)
}

/// Replace the literal `:start` and `:end` placeholder tokens with the chunk
/// bounds as decimal integers. No other substitution is performed.
pub fn substitute_bounds(sql: &str, start: i64, end: i64) -> String {
    sql.replace(":start", &start.to_string())
        .replace(":end", &end.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Migration> {
        parse_migration(content, Path::new("test.sql"))
    }

    #[test]
    fn test_parse_full_migration() {
        let content = "\
-- psc: migrate name=backfill_totals
-- psc: target service=orders
-- psc: batch column=id chunk=50000 parallelism=4
-- psc: on_error continue
-- psc: timeout 90s
UPDATE orders SET total = subtotal + tax
WHERE id BETWEEN :start AND :end;
";
        let m = parse(content).unwrap();
        assert_eq!(m.name, "backfill_totals");
        assert_eq!(m.service.as_deref(), Some("orders"));
        assert_eq!(m.batch_column.as_deref(), Some("id"));
        assert_eq!(m.chunk_size, 50000);
        assert_eq!(m.parallelism, 4);
        assert_eq!(m.on_error, OnError::Continue);
        assert_eq!(m.timeout, Some(Duration::from_secs(90)));
        assert!(m.is_batched());
        assert!(m.sql.starts_with("UPDATE orders"));
        assert!(!m.sql.contains("psc:"));
    }

    #[test]
    fn test_defaults() {
        let m = parse("-- psc: migrate name=simple\nDELETE FROM t WHERE done;\n").unwrap();
        assert_eq!(m.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(m.parallelism, 1);
        assert_eq!(m.on_error, OnError::Abort);
        assert_eq!(m.timeout, None);
        assert!(m.service.is_none());
        assert!(!m.is_batched());
    }

    #[test]
    fn test_missing_name_is_error() {
        let err = parse("UPDATE t SET x = 1;\n").unwrap_err();
        assert!(matches!(err, PscError::Config(_)));
        assert!(err.to_string().contains("migrate name"));
    }

    #[test]
    fn test_invalid_on_error_rejected() {
        let err = parse("-- psc: migrate name=x\n-- psc: on_error explode\nSELECT 1;").unwrap_err();
        assert!(err.to_string().contains("on_error"));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = parse("-- psc: migrate name=x\n-- psc: timeout soon\nSELECT 1;").unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_unknown_directive_ignored() {
        let m = parse("-- psc: migrate name=x\n-- psc: shiny option=1\nSELECT 1;").unwrap();
        assert_eq!(m.name, "x");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_substitute_bounds() {
        let sql = "UPDATE t SET x = 1 WHERE id >= :start AND id <= :end AND note <> ':startish'";
        let out = substitute_bounds(sql, 100, 199);
        assert_eq!(
            out,
            "UPDATE t SET x = 1 WHERE id >= 100 AND id <= 199 AND note <> '100ish'"
        );
    }

    #[test]
    fn test_substitute_is_literal_token_replacement() {
        assert_eq!(substitute_bounds("no placeholders", 1, 2), "no placeholders");
        assert_eq!(substitute_bounds(":start-:end", 0, 9), "0-9");
    }
}
