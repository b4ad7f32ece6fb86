//! pg_service.conf parsing and connection-string rendering.
//!
//! The service file is a plain-text, section-based `key = value` format with
//! `[name]` section headers, the subset of libpq's connection service file
//! this tool needs: `host`, `port`, `dbname`, `user`, `password`. Comment
//! lines (`#` or `;`) and blank lines are skipped; unknown keys are ignored.

use crate::error::{PscError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Default port when a service section omits `port`.
pub const DEFAULT_PORT: u16 = 5432;

/// Connection parameters for one `[service]` section.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    pub port: u16,

    /// Database name.
    pub dbname: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,
}

impl ServiceConfig {
    /// Render a libpq-style connection string with `sslmode=require`.
    pub fn connection_string(&self) -> String {
        self.connection_string_with_ssl("require")
    }

    /// Render a libpq-style connection string with the given `sslmode`.
    pub fn connection_string_with_ssl(&self, sslmode: &str) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            self.host, self.port, self.dbname, self.user, self.password, sslmode
        )
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// All services parsed from one file, keyed by section name.
pub type ServiceMap = HashMap<String, ServiceConfig>;

/// Locate the service file: `$PGSERVICEFILE` if set, else `~/.pg_service.conf`.
pub fn default_service_file() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("PGSERVICEFILE") {
        return Ok(PathBuf::from(path));
    }
    std::env::var_os("HOME")
        .map(|home| Path::new(&home).join(".pg_service.conf"))
        .ok_or_else(|| {
            PscError::Config("cannot locate service file: HOME is not set".to_string())
        })
}

/// Parse a service file from disk.
pub fn parse_service_file(path: impl AsRef<Path>) -> Result<ServiceMap> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        PscError::Config(format!("failed to read service file {}: {}", path.display(), e))
    })?;
    parse_services(&content)
}

/// Parse service-file content.
pub fn parse_services(content: &str) -> Result<ServiceMap> {
    let mut services = ServiceMap::new();
    let mut current: Option<(String, RawSection)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if let Some((name, raw)) = current.take() {
                services.insert(name.clone(), raw.finish(&name)?);
            }
            let name = line[1..line.len() - 1].trim().to_string();
            current = Some((name, RawSection::default()));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        let Some((_, raw)) = current.as_mut() else {
            // Key-value pair before any section header; nothing to attach it to.
            continue;
        };
        match key {
            "host" => raw.host = Some(value.to_string()),
            "port" => raw.port = Some(value.to_string()),
            "dbname" => raw.dbname = Some(value.to_string()),
            "user" => raw.user = Some(value.to_string()),
            "password" => raw.password = Some(value.to_string()),
            _ => {} // unknown keys ignored
        }
    }

    if let Some((name, raw)) = current.take() {
        services.insert(name.clone(), raw.finish(&name)?);
    }

    Ok(services)
}

/// Look up a service by name, with a helpful error naming the file.
pub fn resolve_service(services: &ServiceMap, name: &str) -> Result<ServiceConfig> {
    services.get(name).cloned().ok_or_else(|| {
        PscError::Config(format!("service '{}' not found in service file", name))
    })
}

/// Accumulator for one section while scanning.
#[derive(Default)]
struct RawSection {
    host: Option<String>,
    port: Option<String>,
    dbname: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

impl RawSection {
    fn finish(self, section: &str) -> Result<ServiceConfig> {
        let port = match self.port {
            Some(p) => p.parse::<u16>().map_err(|_| {
                PscError::Config(format!("service '{}': invalid port '{}'", section, p))
            })?,
            None => DEFAULT_PORT,
        };
        Ok(ServiceConfig {
            host: self.host.unwrap_or_default(),
            port,
            dbname: self.dbname.unwrap_or_default(),
            user: self.user.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_two_services() {
        let input = "[prod]\nhost=h\ndbname=d\nuser=u\npassword=p\n[dev]\nhost=h2\nport=6000\ndbname=d\nuser=u\npassword=p\n";
        let services = parse_services(input).unwrap();
        assert_eq!(services.len(), 2);

        let prod = &services["prod"];
        assert_eq!(prod.host, "h");
        assert_eq!(prod.port, 5432);
        assert_eq!(prod.dbname, "d");
        assert_eq!(prod.user, "u");
        assert_eq!(prod.password, "p");

        let dev = &services["dev"];
        assert_eq!(dev.host, "h2");
        assert_eq!(dev.port, 6000);
    }

    #[test]
    fn test_comments_and_unknown_keys_ignored() {
        let input = "# global comment\n[prod]\n; another comment\nhost = h\nsslcert = ignored\ndbname = d\nuser = u\npassword = p\n\n";
        let services = parse_services(input).unwrap();
        let prod = &services["prod"];
        assert_eq!(prod.host, "h");
        assert_eq!(prod.dbname, "d");
        // Unknown key does not alter the map shape
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn test_whitespace_trimmed() {
        let input = "[ padded ]\n  host =  example.com  \n  port= 5433\n";
        let services = parse_services(input).unwrap();
        let cfg = &services["padded"];
        assert_eq!(cfg.host, "example.com");
        assert_eq!(cfg.port, 5433);
    }

    #[test]
    fn test_missing_port_defaults() {
        let services = parse_services("[a]\nhost=x\n").unwrap();
        assert_eq!(services["a"].port, 5432);
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let err = parse_services("[a]\nport=not-a-number\n").unwrap_err();
        assert!(matches!(err, PscError::Config(_)));
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn test_connection_string() {
        let cfg = ServiceConfig {
            host: "h".into(),
            port: 5432,
            dbname: "d".into(),
            user: "u".into(),
            password: "p".into(),
        };
        assert_eq!(
            cfg.connection_string(),
            "host=h port=5432 dbname=d user=u password=p sslmode=require"
        );
        assert_eq!(
            cfg.connection_string_with_ssl("disable"),
            "host=h port=5432 dbname=d user=u password=p sslmode=disable"
        );
    }

    #[test]
    fn test_connection_string_parses_for_driver() {
        let cfg = ServiceConfig {
            host: "db.internal".into(),
            port: 6432,
            dbname: "orders".into(),
            user: "svc".into(),
            password: "secret".into(),
        };
        let parsed: tokio_postgres::Config = cfg.connection_string().parse().unwrap();
        assert_eq!(parsed.get_dbname(), Some("orders"));
        assert_eq!(parsed.get_user(), Some("svc"));
    }

    #[test]
    fn test_parse_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[prod]\nhost=h\ndbname=d\nuser=u\npassword=p\n")
            .unwrap();
        file.flush().unwrap();

        let services = parse_service_file(file.path()).unwrap();
        assert!(services.contains_key("prod"));
    }

    #[test]
    fn test_resolve_missing_service() {
        let services = parse_services("[prod]\nhost=h\n").unwrap();
        let err = resolve_service(&services, "staging").unwrap_err();
        assert!(matches!(err, PscError::Config(_)));
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let cfg = ServiceConfig {
            host: "h".into(),
            port: 5432,
            dbname: "d".into(),
            user: "u".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }
}
