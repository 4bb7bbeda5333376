//! SQLite-backed store that survives process restarts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use satchel_core::StoreName;
use tracing::{debug, info};

use crate::{CacheEntry, CacheStorage, RequestKey, StoreError, StoreResult};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Store backend persisted in a SQLite file.
pub struct SqliteCacheStorage {
    conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
    /// Open (or create) the database at `path`.
    pub fn open_path(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened persistent cache storage");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Create tables on a fresh database, or verify the recorded version
fn init_schema(conn: &Connection) -> StoreResult<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version < 1 {
        create_schema_v1(conn)?;
    }

    Ok(())
}

fn create_schema_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stores (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            store TEXT NOT NULL REFERENCES stores(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            response_url TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (store, method, url)
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;

    debug!(version = SCHEMA_VERSION, "Created cache schema");
    Ok(())
}

fn ensure_store(conn: &Connection, name: &StoreName) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO stores (name, created_at) VALUES (?, ?)",
        params![name.as_str(), Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

impl CacheStorage for SqliteCacheStorage {
    fn open(&self, name: &StoreName) -> StoreResult<()> {
        ensure_store(&*self.conn()?, name)
    }

    fn has(&self, name: &StoreName) -> StoreResult<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM stores WHERE name = ?",
            [name.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn keys(&self) -> StoreResult<Vec<StoreName>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM stores ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|name| name.map(StoreName::from_raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn delete(&self, name: &StoreName) -> StoreResult<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM stores WHERE name = ?", [name.as_str()])?;
        Ok(removed > 0)
    }

    fn put(&self, name: &StoreName, entry: CacheEntry) -> StoreResult<()> {
        let headers = serde_json::to_string(&entry.headers)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_store(&tx, name)?;
        tx.execute(
            "INSERT OR REPLACE INTO entries
                (store, method, url, status, headers, body, response_url, cached_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                name.as_str(),
                entry.key.method,
                entry.key.url,
                entry.status,
                headers,
                entry.body.as_ref(),
                entry.response_url,
                entry.cached_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn match_request(&self, name: &StoreName, key: &RequestKey) -> StoreResult<Option<CacheEntry>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT status, headers, body, response_url, cached_at
                 FROM entries WHERE store = ? AND method = ? AND url = ?",
                params![name.as_str(), key.method, key.url],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, headers, body, response_url, cached_at)) = row else {
            return Ok(None);
        };

        Ok(Some(CacheEntry {
            key: key.clone(),
            status,
            headers: serde_json::from_str(&headers)?,
            body: Bytes::from(body),
            response_url,
            cached_at,
        }))
    }

    fn entry_count(&self, name: &StoreName) -> StoreResult<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM entries WHERE store = ?",
            [name.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn entry(url: &str, body: &'static [u8]) -> CacheEntry {
        CacheEntry {
            key: RequestKey::new("GET", &Url::parse(url).unwrap()),
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: Bytes::from_static(body),
            response_url: url.to_string(),
            cached_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_put_and_match() {
        let storage = SqliteCacheStorage::open_in_memory().unwrap();
        let name = StoreName::from("site-static-v1.0.3");
        storage.put(&name, entry("https://example.com/", b"<html>")).unwrap();

        let key = RequestKey::new("GET", &Url::parse("https://example.com/").unwrap());
        let hit = storage.match_request(&name, &key).unwrap().unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from_static(b"<html>"));
        assert_eq!(hit.headers[0].1, "text/html");
        assert_eq!(hit.cached_at, 1_700_000_000_000);
    }

    #[test]
    fn test_delete_cascades_entries() {
        let storage = SqliteCacheStorage::open_in_memory().unwrap();
        let name = StoreName::from("site-static-v1.0.2");
        storage.put(&name, entry("https://example.com/a", b"a")).unwrap();
        storage.put(&name, entry("https://example.com/b", b"b")).unwrap();
        assert_eq!(storage.entry_count(&name).unwrap(), 2);

        assert!(storage.delete(&name).unwrap());
        assert_eq!(storage.entry_count(&name).unwrap(), 0);
        assert!(storage.keys().unwrap().is_empty());
    }

    #[test]
    fn test_keys_sorted() {
        let storage = SqliteCacheStorage::open_in_memory().unwrap();
        storage.open(&StoreName::from("site-static-v2")).unwrap();
        storage.open(&StoreName::from("site-static-v1")).unwrap();
        storage.open(&StoreName::from("site-static-v1")).unwrap();

        assert_eq!(
            storage.keys().unwrap(),
            vec![
                StoreName::from("site-static-v1"),
                StoreName::from("site-static-v2")
            ]
        );
    }

    #[test]
    fn test_reopen_file_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite3");
        let name = StoreName::from("site-static-v1");

        {
            let storage = SqliteCacheStorage::open_path(&path).unwrap();
            storage.put(&name, entry("https://example.com/", b"kept")).unwrap();
        }

        let storage = SqliteCacheStorage::open_path(&path).unwrap();
        assert_eq!(storage.entry_count(&name).unwrap(), 1);
        assert_eq!(storage.keys().unwrap(), vec![name]);
    }
}
