//! Migration repository scanning.
//!
//! A repository is a directory of `.sql` migration files. A scan parses every
//! file and registers it in the record store; files that fail to parse are
//! collected rather than aborting the scan, so one bad file never hides the
//! rest of the repo.

use crate::error::{PscError, Result};
use std::path::Path;
use tracing::{debug, warn};

use super::migration::{parse_migration_file, Migration};
use super::record::RecordStore;

/// Outcome of scanning a repository directory.
#[derive(Debug, Default)]
pub struct RepoScan {
    /// Successfully parsed migrations, ordered by file name.
    pub migrations: Vec<Migration>,

    /// Parse failures, one message per bad file.
    pub errors: Vec<String>,
}

/// Parse every `.sql` file under `dir`.
pub fn scan_repo(dir: impl AsRef<Path>) -> Result<RepoScan> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PscError::Config(format!("failed to read repo dir {}: {}", dir.display(), e)))?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("sql")
        })
        .collect();
    paths.sort();

    let mut scan = RepoScan::default();
    for path in paths {
        match parse_migration_file(&path) {
            Ok(migration) => {
                debug!("parsed migration '{}' from {}", migration.name, path.display());
                scan.migrations.push(migration);
            }
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                scan.errors.push(e.to_string());
            }
        }
    }
    Ok(scan)
}

/// Register scanned migrations in the record store.
pub async fn sync_records(store: &RecordStore, migrations: &[Migration]) -> Result<()> {
    store.ensure_table().await?;
    for migration in migrations {
        store.upsert(migration).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_parses_sql_files_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("02_second.sql"),
            "-- psc: migrate name=second\nSELECT 2;",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("01_first.sql"),
            "-- psc: migrate name=first\nSELECT 1;",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scan = scan_repo(dir.path()).unwrap();
        assert!(scan.errors.is_empty());
        let names: Vec<&str> = scan.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_scan_collects_parse_errors() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("good.sql"), "-- psc: migrate name=good\nSELECT 1;")
            .unwrap();
        std::fs::write(dir.path().join("bad.sql"), "SELECT 1; -- no name directive").unwrap();

        let scan = scan_repo(dir.path()).unwrap();
        assert_eq!(scan.migrations.len(), 1);
        assert_eq!(scan.errors.len(), 1);
        assert!(scan.errors[0].contains("migrate name"));
    }

    #[test]
    fn test_scan_missing_dir_is_config_error() {
        let err = scan_repo("/does/not/exist").unwrap_err();
        assert!(matches!(err, PscError::Config(_)));
    }
}
