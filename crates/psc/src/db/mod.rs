//! Database connection management.
//!
//! Builds deadpool-postgres pools from service definitions. Connections try
//! `sslmode=require` first and fall back to `sslmode=disable` when the server
//! has no SSL support; every other failure is fatal.

use crate::error::{PscError, Result};
use crate::service::ServiceConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

/// Connection timeout applied to every pool.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a pool for the named service, pinging it before returning.
///
/// The pool is sized `pool_size`; callers size it to at least the operation's
/// parallelism so workers never serialize on a connection.
pub async fn connect_service(name: &str, config: &ServiceConfig, pool_size: usize) -> Result<Pool> {
    match build_and_ping(config, "require", pool_size).await {
        Ok(pool) => {
            info!(
                "Connected to '{}' at {}:{}/{} (sslmode=require)",
                name, config.host, config.port, config.dbname
            );
            Ok(pool)
        }
        Err(err) if is_ssl_unsupported(&err) => {
            info!("SSL not supported by '{}', retrying without SSL", name);
            let pool = build_and_ping(config, "disable", pool_size)
                .await
                .map_err(|e| PscError::Connect {
                    service: name.to_string(),
                    message: e.to_string(),
                })?;
            info!(
                "Connected to '{}' at {}:{}/{} (sslmode=disable)",
                name, config.host, config.port, config.dbname
            );
            Ok(pool)
        }
        Err(err) => Err(PscError::Connect {
            service: name.to_string(),
            message: err.to_string(),
        }),
    }
}

/// Build a pool for the given sslmode and verify it with `SELECT 1`.
async fn build_and_ping(config: &ServiceConfig, sslmode: &str, pool_size: usize) -> Result<Pool> {
    let mut pg_config: PgConfig = config
        .connection_string_with_ssl(sslmode)
        .parse()
        .map_err(|e: tokio_postgres::Error| PscError::Config(e.to_string()))?;

    // Connection options for reliability
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(CONNECT_TIMEOUT);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let pool = if sslmode == "disable" {
        warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
        let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
        Pool::builder(mgr)
            .max_size(pool_size)
            .build()
            .map_err(|e| PscError::pool(e, "creating pool (no TLS)"))?
    } else {
        let tls_connector = MakeRustlsConnect::new(build_tls_config());
        let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
        Pool::builder(mgr)
            .max_size(pool_size)
            .build()
            .map_err(|e| PscError::pool(e, "creating pool (TLS)"))?
    };

    let client = pool
        .get()
        .await
        .map_err(|e| PscError::pool(e, "testing connection"))?;
    client.simple_query("SELECT 1").await?;

    Ok(pool)
}

/// TLS configuration for `sslmode=require`: encryption without certificate
/// verification, matching libpq's semantics for that mode.
fn build_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PermissiveVerifier))
        .with_no_client_auth()
}

/// Whether a connect/ping failure means the server has no SSL support.
fn is_ssl_unsupported(err: &PscError) -> bool {
    let msg = err.to_string();
    msg.contains("SSL is not enabled")
        || msg.contains("does not support TLS")
        || msg.contains("server does not support encryption")
}

/// Check whether a table exists on the given database.
pub async fn table_exists(pool: &Pool, table: &str) -> Result<bool> {
    let client = pool
        .get()
        .await
        .map_err(|e| PscError::pool(e, "checking table existence"))?;

    // Accept both bare and schema-qualified names.
    let (schema, name) = match table.split_once('.') {
        Some((s, t)) => (Some(s), t),
        None => (None, table),
    };

    let row = match schema {
        Some(schema) => {
            client
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = $1 AND table_name = $2)",
                    &[&schema, &name],
                )
                .await?
        }
        None => {
            client
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_name = $1)",
                    &[&name],
                )
                .await?
        }
    };
    Ok(row.get::<_, bool>(0))
}

/// Estimate the row count of a table from planner statistics, falling back to
/// `COUNT(*)` when no estimate is available. Used only for progress display.
pub async fn estimated_row_count(pool: &Pool, table: &str) -> Result<i64> {
    let client = pool
        .get()
        .await
        .map_err(|e| PscError::pool(e, "estimating row count"))?;

    let bare = table.rsplit('.').next().unwrap_or(table);
    if let Ok(row) = client
        .query_one(
            "SELECT reltuples::bigint FROM pg_class WHERE relname = $1",
            &[&bare],
        )
        .await
    {
        let estimate: i64 = row.get(0);
        if estimate > 0 {
            return Ok(estimate);
        }
    }

    debug!("no planner estimate for {}, falling back to COUNT(*)", table);
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await?;
    Ok(row.get::<_, i64>(0))
}

/// Probe the maximum value of a key column, treating an empty table as 0.
pub async fn max_key(pool: &Pool, table: &str, key_column: &str) -> Result<i64> {
    let client = pool
        .get()
        .await
        .map_err(|e| PscError::pool(e, "probing max key"))?;

    let sql = format!(
        "SELECT COALESCE(MAX({}), 0)::bigint FROM {}",
        quote_ident(key_column),
        table
    );
    let row = client.query_one(&sql, &[]).await?;
    Ok(row.get::<_, i64>(0))
}

/// Execute semicolon-separated setup SQL on one session, stopping at the
/// first failure.
pub async fn run_setup_sql(pool: &Pool, setup: &str) -> Result<()> {
    let client = pool
        .get()
        .await
        .map_err(|e| PscError::pool(e, "running setup SQL"))?;

    for stmt in setup.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        debug!("setup: {}", stmt);
        client
            .batch_execute(stmt)
            .await
            .map_err(|e| PscError::Config(format!("target setup failed on '{}': {}", stmt, e)))?;
    }
    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Certificate verifier backing `sslmode=require`: the session is encrypted
/// but the server certificate and handshake signatures are accepted
/// unconditionally, which is what libpq's `require` mode promises. The
/// connect flow never builds TLS any other way, so there is no verifying
/// variant of this type.
#[derive(Debug)]
struct PermissiveVerifier;

impl ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        // Signatures are not checked, so advertise everything the server
        // might pick rather than constraining its choice.
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("id"), "\"id\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_ssl_unsupported_detection() {
        let err = PscError::Config("pq: SSL is not enabled on the server".into());
        assert!(is_ssl_unsupported(&err));

        let err = PscError::Config("error: server does not support TLS".into());
        assert!(is_ssl_unsupported(&err));

        let err = PscError::Config("password authentication failed".into());
        assert!(!is_ssl_unsupported(&err));
    }
}
