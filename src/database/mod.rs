//! 存储层
//!
//! - `DatabaseManager`：r2d2 连接池、WAL checkpoint、快照与整库替换
//! - `BlogPostRepo`：blog_posts 表 CRUD
//! - schema 初始化与增量迁移

mod blog_repo;
mod manager;

pub use blog_repo::BlogPostRepo;
pub use manager::DatabaseManager;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::collections::HashSet;

pub type SqlitePool = Pool<SqliteConnectionManager>;
pub type SqlitePooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 解析数据库中的时间字段
///
/// 兼容 RFC 3339 以及旧版本写入的 `YYYY-MM-DD HH:MM:SS[.ffffff]`（按 UTC 处理）。
pub(crate) fn parse_datetime_flexible(datetime_str: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(naive_dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive_dt, Utc));
    }

    Err(anyhow::anyhow!(
        "Failed to parse datetime from '{}'",
        datetime_str
    ))
}

/// 建表（幂等）并执行增量迁移
pub(crate) fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blog_posts (
            id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            author TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            view_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_blog_posts_title ON blog_posts(title);
        CREATE INDEX IF NOT EXISTS idx_blog_posts_created_at ON blog_posts(created_at);",
    )?;
    ensure_blog_posts_columns(conn)?;
    Ok(())
}

/// 旧库可能缺少后加的列（view_count 于早期版本之后引入），按需补齐
pub(crate) fn ensure_blog_posts_columns(conn: &Connection) -> Result<()> {
    let mut existing = HashSet::new();
    {
        let mut stmt = conn.prepare("PRAGMA table_info('blog_posts')")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            existing.insert(name.to_lowercase());
        }
    }

    let required_columns: [(&str, &str); 1] = [("view_count", "INTEGER DEFAULT 0")];

    for (name, ty) in required_columns.iter() {
        if !existing.contains(*name) {
            tracing::info!("[Migration] blog_posts 缺少列 {}，正在补齐", name);
            let sql = format!("ALTER TABLE blog_posts ADD COLUMN {} {}", name, ty);
            conn.execute(&sql, [])?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_adds_view_count_to_legacy_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE blog_posts (
                id TEXT PRIMARY KEY, title TEXT, content TEXT NOT NULL, author TEXT NOT NULL,
                created_at TEXT, updated_at TEXT
            );
            INSERT INTO blog_posts VALUES ('a', 't', 'c', 'x', '2024-08-01 10:00:00.123456', '2024-08-01 10:00:00');",
        )
        .unwrap();

        initialize_schema(&conn).unwrap();
        // 再次执行应保持幂等
        initialize_schema(&conn).unwrap();

        let views: i64 = conn
            .query_row("SELECT view_count FROM blog_posts WHERE id = 'a'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(views, 0, "旧数据补齐后的 view_count 应为 0");
    }

    #[test]
    fn test_parse_datetime_flexible_formats() {
        assert!(parse_datetime_flexible("2024-08-14T09:30:00Z").is_ok());
        assert!(parse_datetime_flexible("2024-08-14T09:30:00.5+02:00").is_ok());
        assert!(parse_datetime_flexible("2024-08-14 09:30:00.123456").is_ok());
        assert!(parse_datetime_flexible("2024-08-14 09:30:00").is_ok());
        assert!(parse_datetime_flexible("yesterday").is_err());
    }
}
