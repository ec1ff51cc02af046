use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{format_ts, placeholders, Database, IN_CHUNK, NOW_SQL};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub value: Value,
    pub hit_count: i64,
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// SHA-256 of the operation name and its canonicalised arguments. Object
/// keys serialize sorted, strings are trimmed and null fields dropped.
pub fn query_signature(operation: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize(args).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Database {
    /// Look up a cached result. An entry is discarded instead of returned when
    /// it expired, when any file it cited was re-indexed after it was
    /// written, or when a cited file has since been deleted.
    pub fn cache_get(&self, signature: &str) -> Result<Option<CachedResult>> {
        let row: Option<(String, String, String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT result_json, created_at, expires_at, cited_count, hit_count
                 FROM query_cache WHERE signature = ?1",
                params![signature],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        let Some((json, created_at, expires_at, cited_count, hit_count)) = row else {
            return Ok(None);
        };

        let now = format_ts(Utc::now());
        let (live_citations, stale_citations): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(f.indexed_at > ?2), 0)
             FROM query_cache_files c JOIN files f ON f.id = c.file_id
             WHERE c.signature = ?1",
            params![signature, created_at],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let reason = if expires_at < now {
            Some("expired")
        } else if live_citations != cited_count {
            Some("cited file deleted")
        } else if stale_citations > 0 {
            Some("cited file re-indexed")
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::debug!(signature, reason, "query cache entry invalidated");
            self.conn
                .execute("DELETE FROM query_cache WHERE signature = ?1", params![signature])?;
            return Ok(None);
        }

        self.conn.execute(
            &format!(
                "UPDATE query_cache SET hit_count = hit_count + 1, last_hit_at = {NOW_SQL}
                 WHERE signature = ?1"
            ),
            params![signature],
        )?;
        Ok(Some(CachedResult {
            value: serde_json::from_str(&json)?,
            hit_count: hit_count + 1,
        }))
    }

    /// Store a result together with the files it was computed from.
    pub fn cache_put(
        &self,
        signature: &str,
        operation: &str,
        value: &Value,
        cited_file_ids: &[i64],
        ttl_secs: i64,
    ) -> Result<()> {
        let mut cited = cited_file_ids.to_vec();
        cited.sort_unstable();
        cited.dedup();
        let expires_at = format_ts(Utc::now() + Duration::seconds(ttl_secs));
        let json = value.to_string();

        self.with_transaction(|| {
            self.conn
                .execute("DELETE FROM query_cache WHERE signature = ?1", params![signature])?;
            self.conn.execute(
                &format!(
                    "INSERT INTO query_cache (signature, operation, result_json, cited_count,
                                              created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, {NOW_SQL}, ?5)"
                ),
                params![signature, operation, json, cited.len() as i64, expires_at],
            )?;
            let mut stmt = self.conn.prepare(
                "INSERT INTO query_cache_files (signature, file_id)
                 SELECT ?1, id FROM files WHERE id = ?2",
            )?;
            for id in &cited {
                stmt.execute(params![signature, id])?;
            }
            Ok(())
        })
    }

    /// Drop every cache entry citing any of `file_ids`.
    pub fn purge_cache_for_files(&self, file_ids: &[i64]) -> Result<usize> {
        let mut purged = 0;
        for chunk in file_ids.chunks(IN_CHUNK) {
            let sql = format!(
                "DELETE FROM query_cache WHERE signature IN
                    (SELECT signature FROM query_cache_files WHERE file_id IN ({}))",
                placeholders(1, chunk.len())
            );
            purged += self
                .conn
                .execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }
        Ok(purged)
    }

    pub fn purge_expired_cache(&self) -> Result<usize> {
        let n = self.conn.execute(
            &format!("DELETE FROM query_cache WHERE expires_at < {NOW_SQL}"),
            [],
        )?;
        Ok(n)
    }

    pub fn cache_entry_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM query_cache", [], |r| r.get(0))?;
        Ok(n)
    }
}
