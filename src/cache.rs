use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

use crate::autotune::AutotuneResult;
use crate::corridor::CorridorPayload;
use crate::error::{GatewayError, Result};

/// Bump `last_accessed` on reads at most this often.
const ACCESS_BUMP_SECONDS: i64 = 3600;

/// Permanent auto-tune memo, keyed by `(query_id, metric_hash)`. Never
/// TTL-expired and deliberately insensitive to configuration changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PermanentEntry {
    pub request_md5: String,
    pub optimal_period_days: f64,
    pub scale_corridor: bool,
    pub harmonic: u32,
    pub factor: f64,
}

/// One tenant record.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: i64,
    pub url: String,
    pub token: String,
    pub blacklist_uids: Vec<String>,
}

/// Multi-table persistent store backed by sqlite.
///
/// WAL journaling keeps readers off write locks; every mutating operation
/// runs inside its own immediate transaction and racing writers resolve
/// with last-writer-wins `INSERT OR REPLACE` semantics. A failed statement
/// gets one shot at a fresh connection before the error surfaces (callers
/// treat surviving errors as cache misses).
pub struct Cache {
    conn: Mutex<Connection>,
    path: String,
    max_ttl: i64,
}

impl Cache {
    /// Open (creating on demand, directories mode 0755) and migrate the
    /// store at `path`. `:memory:` is accepted for tests.
    pub fn open(path: &str, max_ttl: i64) -> Result<Cache> {
        if path != ":memory:" {
            if let Some(dir) = Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| GatewayError::Cache(format!("create {}: {}", dir.display(), e)))?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755));
                    }
                }
            }
        }
        let conn = Self::connect(path)?;
        Ok(Cache {
            conn: Mutex::new(conn),
            path: path.to_string(),
            max_ttl,
        })
    }

    fn connect(path: &str) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Run `op` against the connection, re-opening once on failure before
    /// giving up.
    fn with_conn<T>(&self, op: impl Fn(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        match op(&mut guard) {
            Ok(v) => Ok(v),
            Err(first) => {
                tracing::warn!(error = %first, path = %self.path, "cache operation failed, re-opening");
                *guard = Self::connect(&self.path)?;
                op(&mut guard).map_err(GatewayError::from)
            }
        }
    }

    /// `md5(query || labels_json)`: the fingerprint of one series within
    /// one query.
    pub fn metric_hash(query: &str, labels_json: &str) -> String {
        format!("{:x}", md5::compute(format!("{}{}", query, labels_json)))
    }

    /// Intern a query, refreshing its `config_hash` and `last_accessed`.
    fn intern_query(
        tx: &rusqlite::Transaction<'_>,
        query: &str,
        config_hash: &str,
        now: i64,
    ) -> rusqlite::Result<i64> {
        tx.execute(
            "INSERT INTO queries (query, config_hash, last_accessed) VALUES (?1, ?2, ?3)
             ON CONFLICT(query) DO UPDATE SET config_hash = ?2, last_accessed = ?3",
            params![query, config_hash, now],
        )?;
        tx.query_row(
            "SELECT id FROM queries WHERE query = ?1",
            params![query],
            |row| row.get(0),
        )
    }

    /// Remember the inline override string a query was last issued with.
    pub fn save_query_params(
        &self,
        query: &str,
        custom_params: &str,
        config_hash: &str,
        now: i64,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let query_id = Self::intern_query(&tx, query, config_hash, now)?;
            tx.execute(
                "UPDATE queries SET custom_params = ?1 WHERE id = ?2",
                params![custom_params, query_id],
            )?;
            tx.commit()
        })
    }

    pub fn query_params(&self, query: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT custom_params FROM queries WHERE query = ?1",
                params![query],
                |row| row.get(0),
            )
            .optional()
            .map(Option::flatten)
        })
    }

    // -- L2: corridor payloads ---------------------------------------------

    /// Persist a corridor payload, replacing any prior entry for the same
    /// fingerprint.
    pub fn save_corridor(
        &self,
        query: &str,
        labels_json: &str,
        payload: &CorridorPayload,
        config_hash: &str,
        now: i64,
    ) -> Result<()> {
        let metric_hash = Self::metric_hash(query, labels_json);
        let body = serde_json::to_string(payload)
            .map_err(|e| GatewayError::Cache(format!("encode corridor payload: {}", e)))?;
        let unused = payload
            .meta
            .labels
            .get("unused_metric")
            .and_then(|v| v.as_str())
            == Some("true");
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let query_id = Self::intern_query(&tx, query, config_hash, now)?;
            tx.execute(
                "INSERT OR REPLACE INTO corridor_entries
                 (query_id, metric_hash, payload, config_hash, unused_metric, created_at, last_accessed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    query_id,
                    metric_hash,
                    body,
                    config_hash,
                    unused,
                    payload.meta.created_at,
                    now
                ],
            )?;
            tx.commit()
        })
    }

    /// Load and decode a corridor payload, bumping `last_accessed` at most
    /// once per hour.
    pub fn load_corridor(
        &self,
        query: &str,
        labels_json: &str,
        now: i64,
    ) -> Result<Option<CorridorPayload>> {
        let metric_hash = Self::metric_hash(query, labels_json);
        let row: Option<(i64, String, i64)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT e.query_id, e.payload, e.last_accessed
                 FROM corridor_entries e JOIN queries q ON q.id = e.query_id
                 WHERE q.query = ?1 AND e.metric_hash = ?2",
                params![query, metric_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;

        let Some((query_id, body, last_accessed)) = row else {
            return Ok(None);
        };

        if now - last_accessed >= ACCESS_BUMP_SECONDS {
            self.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "UPDATE corridor_entries SET last_accessed = ?1
                     WHERE query_id = ?2 AND metric_hash = ?3",
                    params![now, query_id, metric_hash],
                )?;
                tx.execute(
                    "UPDATE queries SET last_accessed = ?1 WHERE id = ?2",
                    params![now, query_id],
                )?;
                tx.commit()
            })?;
        }

        match serde_json::from_str(&body) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable corridor payload, treating as miss");
                Ok(None)
            }
        }
    }

    /// Staleness check: true when no entry exists, the stored config hash
    /// differs, or the entry outlived `max_ttl`. Entries flagged
    /// `unused_metric` stay pinned within TTL regardless of config drift.
    pub fn should_recreate(
        &self,
        query: &str,
        labels_json: &str,
        config_hash: &str,
        now: i64,
    ) -> Result<bool> {
        let metric_hash = Self::metric_hash(query, labels_json);
        let row: Option<(String, bool, i64)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT e.config_hash, e.unused_metric, e.created_at
                 FROM corridor_entries e JOIN queries q ON q.id = e.query_id
                 WHERE q.query = ?1 AND e.metric_hash = ?2",
                params![query, metric_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;

        let Some((stored_hash, unused, created_at)) = row else {
            return Ok(true);
        };
        let expired = now - created_at > self.max_ttl;
        if unused {
            return Ok(expired);
        }
        Ok(expired || stored_hash != config_hash)
    }

    // -- L1: permanent auto-tune memo --------------------------------------

    /// Write the auto-tune memo. Never expires; survives configuration
    /// changes by design.
    pub fn save_autotune(
        &self,
        query: &str,
        labels_json: &str,
        config_hash: &str,
        request_md5: &str,
        result: &AutotuneResult,
        scale_corridor: bool,
        now: i64,
    ) -> Result<()> {
        let metric_hash = Self::metric_hash(query, labels_json);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let query_id = Self::intern_query(&tx, query, config_hash, now)?;
            tx.execute(
                "INSERT OR REPLACE INTO metrics_cache_permanent
                 (query_id, metric_hash, request_md5, optimal_period_days, scale_corridor, harmonic, factor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    query_id,
                    metric_hash,
                    request_md5,
                    result.optimal_period_days,
                    scale_corridor,
                    result.harmonic,
                    result.factor
                ],
            )?;
            tx.commit()
        })
    }

    pub fn load_autotune(&self, query: &str, labels_json: &str) -> Result<Option<PermanentEntry>> {
        let metric_hash = Self::metric_hash(query, labels_json);
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT p.request_md5, p.optimal_period_days, p.scale_corridor, p.harmonic, p.factor
                 FROM metrics_cache_permanent p JOIN queries q ON q.id = p.query_id
                 WHERE q.query = ?1 AND p.metric_hash = ?2",
                params![query, metric_hash],
                |row| {
                    Ok(PermanentEntry {
                        request_md5: row.get(0)?,
                        optimal_period_days: row.get(1)?,
                        scale_corridor: row.get(2)?,
                        harmonic: row.get::<_, i64>(3)? as u32,
                        factor: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- housekeeping ------------------------------------------------------

    /// Drop corridor entries not touched for `days` days, plus query rows
    /// no longer referenced by any table, in one transaction. Returns the
    /// number of corridor entries removed.
    pub fn cleanup_old_entries(&self, days: i64, now: i64) -> Result<usize> {
        let horizon = now - days * 86_400;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM corridor_entries WHERE last_accessed < ?1",
                params![horizon],
            )?;
            tx.execute(
                "DELETE FROM queries WHERE id NOT IN (SELECT query_id FROM corridor_entries)
                 AND id NOT IN (SELECT query_id FROM metrics_cache_permanent)",
                [],
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }

    // -- metric catalog ----------------------------------------------------

    /// Register (or look up) a tenant by upstream URL. The token is
    /// refreshed on every call; the blacklist is preserved.
    pub fn upsert_instance(&self, url: &str, token: &str) -> Result<Instance> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO grafana_instances (url, token, blacklist_uids) VALUES (?1, ?2, '[]')
                 ON CONFLICT(url) DO UPDATE SET token = ?2",
                params![url, token],
            )?;
            let instance = tx.query_row(
                "SELECT id, url, token, blacklist_uids FROM grafana_instances WHERE url = ?1",
                params![url],
                |row| {
                    let raw: String = row.get(3)?;
                    Ok(Instance {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        token: row.get(2)?,
                        blacklist_uids: serde_json::from_str(&raw).unwrap_or_default(),
                    })
                },
            )?;
            tx.commit()?;
            Ok(instance)
        })
    }

    /// Append a datasource UID to the tenant blacklist. Idempotent: an
    /// already-present UID leaves the stored row byte-identical.
    pub fn add_blacklist_uid(&self, instance_id: i64, uid: &str) -> Result<Vec<String>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw: String = tx.query_row(
                "SELECT blacklist_uids FROM grafana_instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )?;
            let mut uids: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
            if !uids.iter().any(|u| u == uid) {
                uids.push(uid.to_string());
                tx.execute(
                    "UPDATE grafana_instances SET blacklist_uids = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&uids).unwrap_or_else(|_| "[]".into()), instance_id],
                )?;
            }
            tx.commit()?;
            Ok(uids)
        })
    }

    /// All known tenants, for the periodic catalog refresher.
    pub fn instances(&self) -> Result<Vec<Instance>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, url, token, blacklist_uids FROM grafana_instances ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                let raw: String = row.get(3)?;
                Ok(Instance {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    token: row.get(2)?,
                    blacklist_uids: serde_json::from_str(&raw).unwrap_or_default(),
                })
            })?;
            rows.collect()
        })
    }

    /// Replace the per-tenant metric catalog: delete all rows for the
    /// tenant, then insert the new set, atomically. Queries in flight see
    /// either snapshot per row.
    pub fn replace_catalog(
        &self,
        instance_id: i64,
        metrics: &[(String, String)],
        now: i64,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM grafana_individual_metrics WHERE instance_id = ?1",
                params![instance_id],
            )?;
            for (key, payload) in metrics {
                tx.execute(
                    "INSERT OR REPLACE INTO grafana_individual_metrics
                     (instance_id, metric_key, payload, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    params![instance_id, key, payload, now],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO grafana_metrics (query, updated_at) VALUES (?1, ?2)",
                    params![key, now],
                )?;
            }
            tx.commit()
        })
    }

    /// Catalog keys for one tenant, sorted.
    pub fn catalog_keys(&self, instance_id: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT metric_key FROM grafana_individual_metrics
                 WHERE instance_id = ?1 ORDER BY metric_key",
            )?;
            let rows = stmt.query_map(params![instance_id], |row| row.get(0))?;
            rows.collect()
        })
    }

    // -- fetch-budget memo -------------------------------------------------

    /// Remember the largest history window that fetched within budget for
    /// a metric.
    pub fn save_max_period(&self, metric_key: &str, days: f64, now: i64) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR REPLACE INTO metrics_max_periods (metric_key, max_period_days, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![metric_key, days, now],
            )?;
            tx.commit()
        })
    }

    pub fn load_max_period(&self, metric_key: &str) -> Result<Option<f64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT max_period_days FROM metrics_max_periods WHERE metric_key = ?1",
                params![metric_key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Raw catalog row bytes, used to verify refresh idempotence.
    pub fn catalog_payload(&self, instance_id: i64, metric_key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT payload FROM grafana_individual_metrics
                 WHERE instance_id = ?1 AND metric_key = ?2",
                params![instance_id, metric_key],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    query         TEXT NOT NULL UNIQUE,
    custom_params TEXT,
    config_hash   TEXT NOT NULL,
    last_accessed INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS corridor_entries (
    query_id      INTEGER NOT NULL,
    metric_hash   TEXT NOT NULL,
    payload       TEXT NOT NULL,
    config_hash   TEXT NOT NULL,
    unused_metric INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL,
    PRIMARY KEY (query_id, metric_hash)
);
CREATE TABLE IF NOT EXISTS metrics_cache_permanent (
    query_id            INTEGER NOT NULL,
    metric_hash         TEXT NOT NULL,
    request_md5         TEXT NOT NULL,
    optimal_period_days REAL NOT NULL,
    scale_corridor      INTEGER NOT NULL DEFAULT 0,
    harmonic            INTEGER NOT NULL DEFAULT 0,
    factor              REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (query_id, metric_hash)
);
CREATE TABLE IF NOT EXISTS grafana_metrics (
    query      TEXT PRIMARY KEY,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS grafana_individual_metrics (
    instance_id INTEGER NOT NULL,
    metric_key  TEXT NOT NULL,
    payload     TEXT,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (instance_id, metric_key)
);
CREATE TABLE IF NOT EXISTS grafana_instances (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    url            TEXT NOT NULL UNIQUE,
    token          TEXT NOT NULL DEFAULT '',
    blacklist_uids TEXT NOT NULL DEFAULT '[]'
);
CREATE TABLE IF NOT EXISTS metrics_max_periods (
    metric_key      TEXT PRIMARY KEY,
    max_period_days REAL NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_corridor_last_accessed
    ON corridor_entries (last_accessed);
"#;
