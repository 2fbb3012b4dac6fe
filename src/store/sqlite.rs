//! SQLite-backed store shared by every process pointing at the same file.

use super::ProxyStore;
use crate::config::{FreshnessQuery, ScoringConfig};
use crate::error::Result;
use crate::proxy::{NewProxy, Proxy, Score};

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

const PROXY_COLUMNS: &str =
    "address, ssl_support, type, locale, score, last_ping, last_speed, created_at, updated_at";

/// A [`ProxyStore`] over the `proxies` and `scoring_config` tables.
///
/// Timestamps are stored as unix milliseconds.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self::with_connection(conn)?;
        info!("Opened proxy store at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Override a proxy's `updated_at`, e.g. when importing history.
    pub fn set_updated_at(&self, address: &str, when: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE proxies SET updated_at = ?1 WHERE address = ?2",
            params![when.timestamp_millis(), address],
        )?;
        Ok(changed > 0)
    }

    fn select_addresses(&self, sql: &str, values: Vec<Value>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS proxies (
            address TEXT PRIMARY KEY,
            ssl_support INTEGER NOT NULL DEFAULT 0,
            type TEXT NOT NULL DEFAULT 'Unknown',
            locale TEXT NOT NULL DEFAULT 'Unknown',
            score INTEGER NOT NULL DEFAULT 100,
            last_ping REAL,
            last_speed REAL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_proxies_score ON proxies(score);
        CREATE TABLE IF NOT EXISTS scoring_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            acquisition_interval_s INTEGER NOT NULL,
            scoring_interval_s INTEGER NOT NULL,
            min_score INTEGER NOT NULL,
            auto_acquisition INTEGER NOT NULL,
            auto_scoring INTEGER NOT NULL,
            max_captcha_retries INTEGER NOT NULL
        );",
    )
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn proxy_from_row(row: &Row<'_>) -> rusqlite::Result<Proxy> {
    Ok(Proxy {
        address: row.get(0)?,
        ssl_support: row.get(1)?,
        kind: row.get(2)?,
        locale: row.get(3)?,
        score: Score::new(row.get(4)?),
        last_ping: row.get(5)?,
        last_speed: row.get(6)?,
        created_at: millis_to_utc(row.get(7)?),
        updated_at: millis_to_utc(row.get(8)?),
    })
}

fn cutoff_millis(max_age: Duration) -> i64 {
    let age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_sub(age)
}

fn limit_value(limit: usize) -> Value {
    Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

impl ProxyStore for SqliteStore {
    fn query_fresh(&self, query: &FreshnessQuery) -> Result<Vec<String>> {
        let mut values = vec![
            Value::Integer(i64::from(query.min_score.value())),
            Value::Integer(cutoff_millis(query.max_age)),
        ];
        let mut sql = "SELECT address FROM proxies WHERE score >= ?1 AND updated_at >= ?2".to_string();
        if !query.locales.is_empty() {
            let placeholders: Vec<String> = (0..query.locales.len())
                .map(|i| format!("?{}", i + 3))
                .collect();
            sql.push_str(&format!(" AND locale IN ({})", placeholders.join(", ")));
            values.extend(query.locales.iter().cloned().map(Value::Text));
        }
        sql.push_str(&format!(
            " ORDER BY score DESC, last_ping IS NULL, last_ping ASC, \
             last_speed IS NULL, last_speed ASC LIMIT ?{}",
            values.len() + 1
        ));
        values.push(limit_value(query.limit));
        self.select_addresses(&sql, values)
    }

    fn query_fresh_fallback(&self, query: &FreshnessQuery) -> Result<Vec<String>> {
        self.select_addresses(
            "SELECT address FROM proxies WHERE score >= ?1 AND updated_at >= ?2 \
             ORDER BY score DESC LIMIT ?3",
            vec![
                Value::Integer(i64::from(query.min_score.value())),
                Value::Integer(cutoff_millis(query.max_age)),
                limit_value(query.limit),
            ],
        )
    }

    fn write_score(&self, address: &str, score: Score, latency: Option<f64>) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE proxies SET score = ?1, last_ping = COALESCE(?2, last_ping), updated_at = ?3
             WHERE address = ?4",
            params![
                i64::from(score.value()),
                latency,
                Utc::now().timestamp_millis(),
                address
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_below(&self, min_score: Score) -> Result<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM proxies WHERE score < ?1",
            params![i64::from(min_score.value())],
        )?;
        Ok(removed)
    }

    fn upsert(&self, proxy: NewProxy) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let existed: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM proxies WHERE address = ?1)",
            params![proxy.address],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO proxies (address, ssl_support, type, locale, score, last_speed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(address) DO UPDATE SET
                ssl_support = excluded.ssl_support,
                type = excluded.type,
                locale = excluded.locale,
                last_speed = COALESCE(excluded.last_speed, proxies.last_speed),
                updated_at = excluded.updated_at",
            params![
                proxy.address,
                proxy.ssl_support,
                proxy.kind,
                proxy.locale,
                i64::from(Score::default().value()),
                proxy.speed,
                now
            ],
        )?;
        Ok(!existed)
    }

    fn get(&self, address: &str) -> Result<Option<Proxy>> {
        let conn = self.conn.lock();
        let proxy = conn
            .query_row(
                &format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE address = ?1"),
                params![address],
                proxy_from_row,
            )
            .optional()?;
        Ok(proxy)
    }

    fn all(&self) -> Result<Vec<Proxy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {PROXY_COLUMNS} FROM proxies"))?;
        let rows = stmt.query_map([], proxy_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_config(&self) -> Result<ScoringConfig> {
        let conn = self.conn.lock();
        let config = conn
            .query_row(
                "SELECT acquisition_interval_s, scoring_interval_s, min_score,
                        auto_acquisition, auto_scoring, max_captcha_retries
                 FROM scoring_config WHERE id = 1",
                [],
                |row| {
                    Ok(ScoringConfig {
                        acquisition_interval_s: row.get::<_, i64>(0)?.max(0) as u64,
                        scoring_interval_s: row.get::<_, i64>(1)?.max(0) as u64,
                        min_score: Score::new(row.get(2)?).value(),
                        auto_acquisition: row.get(3)?,
                        auto_scoring: row.get(4)?,
                        max_captcha_retries: row.get::<_, i64>(5)?.clamp(0, i64::from(u32::MAX)) as u32,
                    })
                },
            )
            .optional()?;
        Ok(config.unwrap_or_default())
    }

    fn save_config(&self, config: &ScoringConfig) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO scoring_config
                (id, acquisition_interval_s, scoring_interval_s, min_score,
                 auto_acquisition, auto_scoring, max_captcha_retries)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                i64::try_from(config.acquisition_interval_s).unwrap_or(i64::MAX),
                i64::try_from(config.scoring_interval_s).unwrap_or(i64::MAX),
                i64::from(config.min_score),
                config.auto_acquisition,
                config.auto_scoring,
                i64::from(config.max_captcha_retries)
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests as shared;
    use tempfile::NamedTempFile;

    #[test]
    fn fresh_query_filters_and_orders() {
        shared::fresh_query_filters_and_orders(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn fallback_ignores_locale() {
        shared::fallback_ignores_locale(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn eviction_removes_low_scores() {
        shared::eviction_removes_low_scores(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn upsert_keeps_score() {
        shared::upsert_keeps_score(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn config_defaults_then_persists() {
        shared::config_defaults_then_persists(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn stale_proxies_are_not_fresh() {
        let store = SqliteStore::open_in_memory().unwrap();
        shared::stale_proxies_are_not_fresh(&store, |address, when| {
            assert!(store.set_updated_at(address, when).unwrap());
        });
    }

    #[test]
    fn two_handles_share_one_file() {
        let file = NamedTempFile::new().unwrap();
        let writer = SqliteStore::open(file.path()).unwrap();
        let reader = SqliteStore::open(file.path()).unwrap();

        writer.upsert(NewProxy::new("192.168.1.1:3128")).unwrap();
        writer
            .write_score("192.168.1.1:3128", Score::new(77), Some(0.8))
            .unwrap();

        let seen = reader.get("192.168.1.1:3128").unwrap().unwrap();
        assert_eq!(seen.score, Score::new(77));
        assert_eq!(seen.last_ping, Some(0.8));
    }
}
