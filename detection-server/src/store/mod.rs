//! 计数持久化
//!
//! 按camera_id保存/加载累计计数，支持跨重启恢复会话。
//! 写入为同步SQLite操作，调用方在阻塞上下文（spawn_blocking）中执行。

use chrono::Utc;
use common::CounterSet;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("数据库操作失败: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// 计数存储抽象
///
/// 仅在源携带稳定camera_id时写入；匿名源（无camera_id）不持久化。
pub trait CounterStore: Send + Sync {
    /// 加载指定相机的持久化计数，无记录返回None
    fn load(&self, camera_id: &str) -> Result<Option<CounterSet>>;

    /// 覆盖写入指定相机的累计计数
    fn save(&self, camera_id: &str, camera_name: Option<&str>, counts: &CounterSet) -> Result<()>;
}

/// SQLite实现
///
/// 单连接+互斥锁足够：写入频率为每N帧一次加停止/故障时一次。
pub struct SqliteCounterStore {
    conn: Mutex<Connection>,
}

impl SqliteCounterStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        info!("✓ 计数数据库就绪: {}", db_path.display());
        Ok(store)
    }

    /// 内存数据库（文件打开失败时的降级路径，重启后计数丢失）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        warn!("计数数据库降级为内存模式，重启后累计计数不可恢复");
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detection_counts (
              camera_id TEXT PRIMARY KEY,
              camera_name TEXT,
              car INTEGER NOT NULL DEFAULT 0,
              motorcycle INTEGER NOT NULL DEFAULT 0,
              bus INTEGER NOT NULL DEFAULT 0,
              truck INTEGER NOT NULL DEFAULT 0,
              updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl CounterStore for SqliteCounterStore {
    fn load(&self, camera_id: &str) -> Result<Option<CounterSet>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT car, motorcycle, bus, truck FROM detection_counts WHERE camera_id = ?1",
                params![camera_id],
                |row| {
                    Ok(CounterSet {
                        car: row.get::<_, i64>(0)? as u64,
                        motorcycle: row.get::<_, i64>(1)? as u64,
                        bus: row.get::<_, i64>(2)? as u64,
                        truck: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn save(&self, camera_id: &str, camera_name: Option<&str>, counts: &CounterSet) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO detection_counts
              (camera_id, camera_name, car, motorcycle, bus, truck, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(camera_id) DO UPDATE SET
              camera_name = excluded.camera_name,
              car = excluded.car,
              motorcycle = excluded.motorcycle,
              bus = excluded.bus,
              truck = excluded.truck,
              updated_at = excluded.updated_at
            "#,
            params![
                camera_id,
                camera_name,
                counts.car as i64,
                counts.motorcycle as i64,
                counts.bus as i64,
                counts.truck as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_returns_none() {
        let store = SqliteCounterStore::open_in_memory().unwrap();
        assert!(store.load("cam-unknown").unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let store = SqliteCounterStore::open_in_memory().unwrap();
        let counts = CounterSet {
            car: 150,
            motorcycle: 320,
            bus: 12,
            truck: 45,
        };
        store.save("cam-1", Some("东门摄像头"), &counts).unwrap();
        assert_eq!(store.load("cam-1").unwrap(), Some(counts));
    }

    #[test]
    fn test_save_overwrites_existing_row() {
        let store = SqliteCounterStore::open_in_memory().unwrap();
        store
            .save("cam-1", None, &CounterSet { car: 1, ..Default::default() })
            .unwrap();
        store
            .save("cam-1", None, &CounterSet { car: 9, truck: 2, ..Default::default() })
            .unwrap();

        let loaded = store.load("cam-1").unwrap().unwrap();
        assert_eq!(loaded.car, 9);
        assert_eq!(loaded.truck, 2);
    }

    #[test]
    fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.db");

        {
            let store = SqliteCounterStore::open(&path).unwrap();
            store
                .save("cam-7", Some("gate"), &CounterSet { bus: 4, ..Default::default() })
                .unwrap();
        }

        let store = SqliteCounterStore::open(&path).unwrap();
        assert_eq!(store.load("cam-7").unwrap().unwrap().bus, 4);
    }
}
