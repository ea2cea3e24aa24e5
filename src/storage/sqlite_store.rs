use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::Value;

use super::area::StorageArea;
use super::event::{StorageBus, StorageEvent, Subscription};

type Conn = PooledConnection<SqliteConnectionManager>;

/// SQLite-backed persistent storage area.
///
/// Several areas may share one database file; each one is isolated by its
/// namespace. Blocking database calls run on tokio's blocking pool, and batched
/// writes run inside a single transaction.
pub struct SqliteArea {
    pool: Pool<SqliteConnectionManager>,
    namespace: String,
    bus: StorageBus,
}

impl SqliteArea {
    /// Opens (or creates) the database at `path` and binds this area to `namespace`.
    pub fn new(path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE |
                    OpenFlags::SQLITE_OPEN_CREATE |
                    OpenFlags::SQLITE_OPEN_URI
            )
            .with_init(|c| {
                c.busy_timeout(std::time::Duration::from_millis(500))?;
                c.execute_batch(
                    "CREATE TABLE IF NOT EXISTS kv_storage (
                        namespace TEXT NOT NULL,
                        key TEXT NOT NULL,
                        value TEXT NOT NULL,
                        updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
                        PRIMARY KEY(namespace, key)
                    );"
                )?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)?;

        Ok(Self {
            pool,
            namespace: namespace.to_string(),
            bus: StorageBus::default(),
        })
    }

    /// Runs `f` with a pooled connection on the blocking thread pool.
    async fn with_conn<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Conn, &str) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();
        let namespace = self.namespace.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn, &namespace)
        })
        .await?
    }
}

fn read_value(conn: &Connection, ns: &str, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM kv_storage WHERE namespace=?1 AND key=?2",
            params![ns, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn read_all(conn: &Connection, ns: &str) -> Result<BTreeMap<String, Value>> {
    let mut stmt =
        conn.prepare("SELECT key, value FROM kv_storage WHERE namespace=?1 ORDER BY key")?;
    let rows = stmt.query_map(params![ns], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (key, raw) = row?;
        out.insert(key, serde_json::from_str(&raw)?);
    }
    Ok(out)
}

fn upsert_all(conn: &mut Conn, ns: &str, items: Vec<(String, Value)>) -> Result<Vec<StorageEvent>> {
    let tx = conn.transaction()?;
    let mut events = Vec::with_capacity(items.len());
    for (key, value) in items {
        let old_value = read_value(&tx, ns, &key)?;
        tx.execute(
            "INSERT INTO kv_storage(namespace,key,value) VALUES (?1,?2,?3)
             ON CONFLICT(namespace,key) DO UPDATE
             SET value=excluded.value, updated_at=strftime('%s','now')",
            params![ns, key, serde_json::to_string(&value)?],
        )?;
        events.push(StorageEvent {
            key,
            old_value,
            new_value: Some(value),
        });
    }
    tx.commit()?;
    Ok(events)
}

fn delete_all(conn: &mut Conn, ns: &str, keys: Vec<String>) -> Result<Vec<StorageEvent>> {
    let tx = conn.transaction()?;
    let mut events = Vec::new();
    for key in keys {
        if let Some(old) = read_value(&tx, ns, &key)? {
            tx.execute(
                "DELETE FROM kv_storage WHERE namespace=?1 AND key=?2",
                params![ns, key],
            )?;
            events.push(StorageEvent {
                key,
                old_value: Some(old),
                new_value: None,
            });
        }
    }
    tx.commit()?;
    Ok(events)
}

#[async_trait]
impl StorageArea for SqliteArea {
    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn, ns| read_value(conn, ns, &key)).await
    }

    async fn get_items(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>> {
        let keys = keys.to_vec();
        self.with_conn(move |conn, ns| {
            keys.into_iter()
                .map(|k| {
                    let v = read_value(conn, ns, &k)?;
                    Ok((k, v))
                })
                .collect()
        })
        .await
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        self.set_items(vec![(key.to_string(), value)]).await
    }

    async fn set_items(&self, items: Vec<(String, Value)>) -> Result<()> {
        let events = self.with_conn(move |conn, ns| upsert_all(conn, ns, items)).await?;
        self.bus.publish_all(events);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.remove_items(&[key.to_string()]).await
    }

    async fn remove_items(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        let events = self.with_conn(move |conn, ns| delete_all(conn, ns, keys)).await?;
        self.bus.publish_all(events);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let events = self
            .with_conn(|conn, ns| {
                let keys = read_all(conn, ns)?.into_keys().collect();
                delete_all(conn, ns, keys)
            })
            .await?;
        self.bus.publish_all(events);
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Value>> {
        self.with_conn(|conn, ns| read_all(conn, ns)).await
    }

    async fn restore_snapshot(&self, data: BTreeMap<String, Value>) -> Result<()> {
        self.set_items(data.into_iter().collect()).await
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}
