//! blog_posts 表 CRUD 操作
//!
//! ## 核心方法
//! - `create_post` / `update_post` / `delete_post`：管理员写操作
//! - `view_post`：单篇读取，匿名访问时原子递增 view_count
//! - `find_by_slug`：按标题现算 slug，返回首个匹配

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{parse_datetime_flexible, DatabaseManager};
use crate::models::{AppError, BlogPost, BlogPostCreate, BlogPostUpdate};
use crate::slug::slugify;

const SELECT_COLUMNS: &str =
    "id, title, content, author, created_at, updated_at, COALESCE(view_count, 0)";

/// blog_posts 表 Repo
pub struct BlogPostRepo;

fn row_to_post(row: &Row) -> rusqlite::Result<BlogPost> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let conversion = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    Ok(BlogPost {
        id: Uuid::parse_str(&id).map_err(|e| conversion(0, Box::new(e)))?,
        title: row.get(1)?,
        content: row.get(2)?,
        author: row.get(3)?,
        created_at: parse_datetime_flexible(&created_at).map_err(|e| conversion(4, e.into()))?,
        updated_at: parse_datetime_flexible(&updated_at).map_err(|e| conversion(5, e.into()))?,
        view_count: row.get(6)?,
    })
}

/// 固定宽度的 UTC 时间串，保证按字符串排序即按时间排序
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 旧数据的 id 可能以 32 位无连字符形式存储，两种形式都参与匹配
fn id_forms(id: &Uuid) -> (String, String) {
    (id.hyphenated().to_string(), id.simple().to_string())
}

impl BlogPostRepo {
    pub fn create_post(db: &DatabaseManager, input: &BlogPostCreate) -> Result<BlogPost, AppError> {
        let conn = db.get_conn()?;
        Self::create_post_with_conn(&conn, input)
    }

    pub fn create_post_with_conn(
        conn: &Connection,
        input: &BlogPostCreate,
    ) -> Result<BlogPost, AppError> {
        input.validate()?;
        // 与落库精度一致，保证返回值与再次读取的结果相同
        let now = Utc::now().trunc_subsecs(6);
        let post = BlogPost {
            id: Uuid::new_v4(),
            title: input.title.clone(),
            content: input.content.clone(),
            author: input.author.clone(),
            created_at: now,
            updated_at: now,
            view_count: 0,
        };

        conn.execute(
            "INSERT INTO blog_posts (id, title, content, author, created_at, updated_at, view_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                post.id.to_string(),
                post.title,
                post.content,
                post.author,
                format_ts(&post.created_at),
                format_ts(&post.updated_at),
            ],
        )?;

        info!("[BlogPostRepo] 创建文章: id={}", post.id);
        Ok(post)
    }

    pub fn get_post(db: &DatabaseManager, id: &Uuid) -> Result<Option<BlogPost>, AppError> {
        let conn = db.get_conn()?;
        Self::get_post_with_conn(&conn, id)
    }

    pub fn get_post_with_conn(conn: &Connection, id: &Uuid) -> Result<Option<BlogPost>, AppError> {
        let (hyphenated, simple) = id_forms(id);
        let sql = format!(
            "SELECT {} FROM blog_posts WHERE id = ?1 OR id = ?2 LIMIT 1",
            SELECT_COLUMNS
        );
        let post = conn
            .query_row(&sql, params![hyphenated, simple], row_to_post)
            .optional()?;
        Ok(post)
    }

    /// 读取单篇文章；`count_view` 为真时先原子递增 view_count
    ///
    /// 返回递增后的存储状态。
    pub fn view_post(
        db: &DatabaseManager,
        id: &Uuid,
        count_view: bool,
    ) -> Result<Option<BlogPost>, AppError> {
        let conn = db.get_conn()?;
        if count_view {
            Self::increment_view_count_with_conn(&conn, id)?;
        }
        Self::get_post_with_conn(&conn, id)
    }

    pub fn increment_view_count_with_conn(conn: &Connection, id: &Uuid) -> Result<bool, AppError> {
        let (hyphenated, simple) = id_forms(id);
        let affected = conn.execute(
            "UPDATE blog_posts SET view_count = COALESCE(view_count, 0) + 1 WHERE id = ?1 OR id = ?2",
            params![hyphenated, simple],
        )?;
        debug!("[BlogPostRepo] view_count +1: id={} affected={}", id, affected);
        Ok(affected > 0)
    }

    /// 按插入顺序分页
    pub fn list_page(db: &DatabaseManager, skip: u32, limit: u32) -> Result<Vec<BlogPost>, AppError> {
        let conn = db.get_conn()?;
        let sql = format!(
            "SELECT {} FROM blog_posts ORDER BY rowid ASC LIMIT ?1 OFFSET ?2",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let posts = stmt
            .query_map(params![limit, skip], row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    /// 最新文章，按创建时间倒序
    pub fn list_latest(db: &DatabaseManager, limit: u32) -> Result<Vec<BlogPost>, AppError> {
        let conn = db.get_conn()?;
        let sql = format!(
            "SELECT {} FROM blog_posts ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let posts = stmt
            .query_map(params![limit], row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    pub fn list_all(db: &DatabaseManager) -> Result<Vec<BlogPost>, AppError> {
        let conn = db.get_conn()?;
        Self::list_all_with_conn(&conn)
    }

    pub fn list_all_with_conn(conn: &Connection) -> Result<Vec<BlogPost>, AppError> {
        let sql = format!(
            "SELECT {} FROM blog_posts ORDER BY created_at DESC, rowid DESC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let posts = stmt
            .query_map([], row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    pub fn count_posts(db: &DatabaseManager) -> Result<i64, AppError> {
        let conn = db.get_conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM blog_posts", [], |row| row.get(0))?;
        Ok(count)
    }

    /// 按 slug 查找，首个匹配胜出（不保证唯一）
    pub fn find_by_slug(db: &DatabaseManager, slug: &str) -> Result<Option<BlogPost>, AppError> {
        let conn = db.get_conn()?;
        let sql = format!("SELECT {} FROM blog_posts ORDER BY rowid ASC", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let post = row_to_post(row)?;
            if slugify(&post.title) == slug {
                return Ok(Some(post));
            }
        }
        Ok(None)
    }

    /// 部分更新，未提供的字段保持不变；updated_at 置为当前时间
    pub fn update_post(
        db: &DatabaseManager,
        id: &Uuid,
        changes: &BlogPostUpdate,
    ) -> Result<Option<BlogPost>, AppError> {
        let mut conn = db.get_conn()?;
        let tx = conn.transaction()?;

        let Some(mut post) = Self::get_post_with_conn(&tx, id)? else {
            return Ok(None);
        };

        if let Some(title) = &changes.title {
            post.title = title.clone();
        }
        if let Some(content) = &changes.content {
            post.content = content.clone();
        }
        if let Some(author) = &changes.author {
            post.author = author.clone();
        }
        post.updated_at = Utc::now().trunc_subsecs(6);

        let (hyphenated, simple) = id_forms(id);
        tx.execute(
            "UPDATE blog_posts SET title = ?1, content = ?2, author = ?3, updated_at = ?4
             WHERE id = ?5 OR id = ?6",
            params![
                post.title,
                post.content,
                post.author,
                format_ts(&post.updated_at),
                hyphenated,
                simple,
            ],
        )?;
        tx.commit()?;

        info!("[BlogPostRepo] 更新文章: id={}", id);
        Ok(Some(post))
    }

    /// 删除文章，返回被删除前的内容
    pub fn delete_post(db: &DatabaseManager, id: &Uuid) -> Result<Option<BlogPost>, AppError> {
        let mut conn = db.get_conn()?;
        let tx = conn.transaction()?;

        let Some(post) = Self::get_post_with_conn(&tx, id)? else {
            return Ok(None);
        };

        let (hyphenated, simple) = id_forms(id);
        tx.execute(
            "DELETE FROM blog_posts WHERE id = ?1 OR id = ?2",
            params![hyphenated, simple],
        )?;
        tx.commit()?;

        info!("[BlogPostRepo] 删除文章: id={}", id);
        Ok(Some(post))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DatabaseManager) {
        let temp = TempDir::new().unwrap();
        let db = DatabaseManager::new(&temp.path().join("blog.db")).unwrap();
        (temp, db)
    }

    fn create(db: &DatabaseManager, title: &str) -> BlogPost {
        BlogPostRepo::create_post(
            db,
            &BlogPostCreate {
                title: title.into(),
                content: "content".into(),
                author: "author".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (_temp, db) = setup();
        let post = create(&db, "First");
        let loaded = BlogPostRepo::get_post(&db, &post.id).unwrap().unwrap();
        assert_eq!(loaded.title, "First");
        assert_eq!(loaded.view_count, 0);
        assert_eq!(BlogPostRepo::count_posts(&db).unwrap(), 1);
    }

    #[test]
    fn test_view_counting() {
        let (_temp, db) = setup();
        let post = create(&db, "Counted");
        for expected in 1..=3 {
            let seen = BlogPostRepo::view_post(&db, &post.id, true).unwrap().unwrap();
            assert_eq!(seen.view_count, expected);
        }
        let seen = BlogPostRepo::view_post(&db, &post.id, false).unwrap().unwrap();
        assert_eq!(seen.view_count, 3, "管理员访问不应计数");
    }

    #[test]
    fn test_view_missing_post_is_none() {
        let (_temp, db) = setup();
        assert!(BlogPostRepo::view_post(&db, &Uuid::new_v4(), true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let (_temp, db) = setup();
        let post = create(&db, "Before");
        let updated = BlogPostRepo::update_post(
            &db,
            &post.id,
            &BlogPostUpdate {
                title: Some("After".into()),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.title, "After");
        assert_eq!(updated.content, "content");
        assert_eq!(updated.author, "author");
        assert!(updated.updated_at >= post.updated_at);
        assert_eq!(updated.created_at, post.created_at);
    }

    #[test]
    fn test_delete_returns_post_once() {
        let (_temp, db) = setup();
        let post = create(&db, "Gone");
        let deleted = BlogPostRepo::delete_post(&db, &post.id).unwrap();
        assert_eq!(deleted.map(|p| p.id), Some(post.id));
        assert!(BlogPostRepo::delete_post(&db, &post.id).unwrap().is_none());
    }

    #[test]
    fn test_find_by_slug_first_match() {
        let (_temp, db) = setup();
        let first = create(&db, "Hello, World!");
        let _second = create(&db, "hello world");
        let found = BlogPostRepo::find_by_slug(&db, "hello-world").unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(BlogPostRepo::find_by_slug(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_latest_is_newest_first() {
        let (_temp, db) = setup();
        let a = create(&db, "a");
        let b = create(&db, "b");
        let c = create(&db, "c");
        let latest: Vec<_> = BlogPostRepo::list_latest(&db, 2)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(latest, vec![c.id, b.id]);
        let all = BlogPostRepo::list_all(&db).unwrap();
        assert_eq!(all.last().map(|p| p.id), Some(a.id));
        let page = BlogPostRepo::list_page(&db, 1, 10).unwrap();
        assert_eq!(page.iter().map(|p| p.id).collect::<Vec<_>>(), vec![b.id, c.id]);
    }

    #[test]
    fn test_legacy_simple_uuid_rows_are_readable() {
        let (_temp, db) = setup();
        let id = Uuid::new_v4();
        {
            let conn = db.get_conn().unwrap();
            conn.execute(
                "INSERT INTO blog_posts (id, title, content, author, created_at, updated_at, view_count)
                 VALUES (?1, 'Legacy', 'c', 'a', '2024-08-14 10:00:00.000000', '2024-08-14 10:00:00.000000', 0)",
                [id.simple().to_string()],
            )
            .unwrap();
        }
        let post = BlogPostRepo::view_post(&db, &id, true).unwrap().unwrap();
        assert_eq!(post.id, id);
        assert_eq!(post.view_count, 1);
    }
}
