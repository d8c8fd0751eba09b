use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use crate::config::MatchThresholds;
use crate::fingerprint::{FingerprintSet, HashKind};
use crate::site::CanonicalSite;

/// Classification state of a whole domain, derived on demand from the
/// corpus. Unsafe propagates domain-wide; safe is tentative and per-path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Unseen,
    MarkedUnsafe,
    MarkedSafe,
}

/// A positive cross-domain similarity hit. Ephemeral: feeds the warning
/// page and the detection log, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusMatch {
    pub matched_site: String,
    pub algorithm: &'static str,
    pub score: i64,
}

/// Persisted fingerprint corpus over SQLite. Doubles as the reference set
/// for similarity search and the authoritative per-domain safety ledger.
///
/// Concurrency relies on SQLite's own locking; detection tolerates eventual
/// consistency, so no transactions span the scan.
#[derive(Debug, Clone)]
pub struct Corpus {
    pool: Pool<Sqlite>,
}

impl Corpus {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let corpus = Self { pool };
        corpus.migrate().await?;
        Ok(corpus)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let corpus = Self { pool };
        corpus.migrate().await?;
        Ok(corpus)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS hashes (
                subdomain TEXT NOT NULL,
                domain TEXT NOT NULL,
                path TEXT NOT NULL,
                hashtype INTEGER NOT NULL,
                hash TEXT NOT NULL,
                safe INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hashes_domain ON hashes (domain)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether any record marks this domain safe or unsafe.
    pub async fn domain_status(&self, domain: &str) -> Result<DomainStatus, sqlx::Error> {
        let row = sqlx::query("SELECT safe FROM hashes WHERE domain = ? LIMIT 1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            None => DomainStatus::Unseen,
            Some(row) if row.get::<i64, _>("safe") == 0 => DomainStatus::MarkedUnsafe,
            Some(_) => DomainStatus::MarkedSafe,
        })
    }

    /// Exact-key variant of `domain_status`.
    pub async fn site_status(&self, site: &CanonicalSite) -> Result<DomainStatus, sqlx::Error> {
        let row = sqlx::query(
            "SELECT safe FROM hashes WHERE subdomain = ? AND domain = ? AND path = ? LIMIT 1",
        )
        .bind(&site.subdomain)
        .bind(&site.domain)
        .bind(&site.path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            None => DomainStatus::Unseen,
            Some(row) if row.get::<i64, _>("safe") == 0 => DomainStatus::MarkedUnsafe,
            Some(_) => DomainStatus::MarkedSafe,
        })
    }

    pub async fn site_exists(&self, site: &CanonicalSite) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT 1 FROM hashes WHERE subdomain = ? AND domain = ? AND path = ? LIMIT 1",
        )
        .bind(&site.subdomain)
        .bind(&site.domain)
        .bind(&site.path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Appends one record per hash kind. A kind whose (type, hash) pair is
    /// already recorded for this exact site is skipped, which makes
    /// concurrent duplicate scans idempotent. Failed hashes arrive absent
    /// from `set` and are stored as empty strings.
    pub async fn insert_fingerprints(
        &self,
        site: &CanonicalSite,
        set: &FingerprintSet,
        safe: bool,
    ) -> Result<(), sqlx::Error> {
        let existing = sqlx::query(
            "SELECT hashtype, hash FROM hashes WHERE subdomain = ? AND domain = ? AND path = ?",
        )
        .bind(&site.subdomain)
        .bind(&site.domain)
        .bind(&site.path)
        .fetch_all(&self.pool)
        .await?;
        let existing: HashSet<(i64, String)> = existing
            .into_iter()
            .map(|row| (row.get::<i64, _>("hashtype"), row.get::<String, _>("hash")))
            .collect();

        for kind in HashKind::ALL {
            let hash = set.get(&kind).map(String::as_str).unwrap_or("");
            if existing.contains(&(kind.code(), hash.to_string())) {
                continue;
            }
            sqlx::query(
                "INSERT INTO hashes (subdomain, domain, path, hashtype, hash, safe)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&site.subdomain)
            .bind(&site.domain)
            .bind(&site.path)
            .bind(kind.code())
            .bind(hash)
            .bind(if safe { 1i64 } else { 0i64 })
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Bulk-updates the safe flag on every record for the domain. Used when
    /// a domain transitions to confirmed-unsafe.
    pub async fn update_domain_status(&self, domain: &str, safe: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE hashes SET safe = ? WHERE domain = ?")
            .bind(if safe { 1i64 } else { 0i64 })
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Brute-force similarity scan over every record belonging to a
    /// *different* domain: same-domain records are legitimate internal
    /// pages, not clone targets. Returns the first record whose score meets
    /// its kind's threshold.
    pub async fn find_match(
        &self,
        domain: &str,
        set: &FingerprintSet,
        thresholds: &MatchThresholds,
    ) -> Result<Option<CorpusMatch>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT subdomain, domain, path, hashtype, hash FROM hashes WHERE domain <> ?",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let Some(kind) = HashKind::from_code(row.get::<i64, _>("hashtype")) else {
                continue;
            };
            let stored: String = row.get("hash");
            let Some(probe) = set.get(&kind) else {
                continue;
            };
            let Some(score) = kind.score(&stored, probe) else {
                continue;
            };

            let matched_site = record_key(
                &row.get::<String, _>("subdomain"),
                &row.get::<String, _>("domain"),
                &row.get::<String, _>("path"),
            );
            debug!(
                algorithm = kind.label(),
                score,
                candidate = %matched_site,
                probe_domain = domain,
                "similarity probe"
            );

            if score >= thresholds.for_kind(kind) {
                return Ok(Some(CorpusMatch {
                    matched_site,
                    algorithm: kind.label(),
                    score,
                }));
            }
        }
        Ok(None)
    }
}

fn record_key(subdomain: &str, domain: &str, path: &str) -> String {
    if subdomain.is_empty() {
        format!("{domain}/{path}")
    } else {
        format!("{subdomain}.{domain}/{path}")
    }
}
