//! `SQLite` hash store and build log.
//!
//! Keeps posts, their perceptual hashes, meme templates and index build
//! records in one database file shared by every worker process.

use super::connection::{acquire_lock, open_connection, open_in_memory, to_sql_id};
use super::metrics::record_operation;
use crate::hashing::ImageHash;
use crate::models::{BuildRecord, MemeTemplate, Post, PostId, PostType, RowId};
use crate::storage::traits::{BuildLog, HashPage, HashStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{instrument, warn};

/// Maximum ids bound into one `IN (...)` clause.
const BATCH_CHUNK: usize = 500;

const POST_COLUMNS: &str =
    "row_id, post_id, author, created_at, subreddit, url, post_type, crosspost_parent, image_hash";

/// `SQLite`-backed [`HashStore`] and [`BuildLog`].
pub struct SqliteHashStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

struct PostRow {
    row_id: i64,
    post_id: String,
    author: String,
    created_at: i64,
    subreddit: String,
    url: String,
    post_type: String,
    crosspost_parent: Option<String>,
    image_hash: Option<String>,
}

impl PostRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            post_id: row.get(1)?,
            author: row.get(2)?,
            created_at: row.get(3)?,
            subreddit: row.get(4)?,
            url: row.get(5)?,
            post_type: row.get(6)?,
            crosspost_parent: row.get(7)?,
            image_hash: row.get(8)?,
        })
    }

    fn into_post(self) -> Post {
        let image_hash = self.image_hash.and_then(|hex| parse_stored_hash(self.row_id, &hex));
        Post {
            row_id: u64::try_from(self.row_id).unwrap_or_default(),
            post_id: PostId::new(self.post_id),
            author: self.author,
            created_at: self.created_at,
            subreddit: self.subreddit,
            url: self.url,
            post_type: PostType::parse(&self.post_type),
            crosspost_parent: self.crosspost_parent,
            image_hash,
        }
    }
}

fn parse_stored_hash(row_id: i64, hex: &str) -> Option<ImageHash> {
    match ImageHash::from_hex(hex) {
        Ok(hash) => Some(hash),
        Err(e) => {
            warn!(row_id, error = %e, "skipping unusable stored hash");
            None
        },
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl SqliteHashStore {
    /// Opens (creating if needed) the store at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let store = Self {
            conn: Mutex::new(open_connection(&db_path)?),
            db_path: Some(db_path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(open_in_memory()?),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Returns the database path.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS posts (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id TEXT NOT NULL UNIQUE,
                author TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                subreddit TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                post_type TEXT NOT NULL DEFAULT 'image',
                crosspost_parent TEXT,
                image_hash TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_posts_hashed
                ON posts(row_id) WHERE image_hash IS NOT NULL;
            CREATE TABLE IF NOT EXISTS meme_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                image_hash TEXT NOT NULL,
                tolerance INTEGER NOT NULL,
                match_cutoff INTEGER
            );
            CREATE TABLE IF NOT EXISTS index_build_times (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                index_type TEXT NOT NULL,
                hostname TEXT NOT NULL,
                item_count INTEGER NOT NULL,
                build_start_ms INTEGER NOT NULL,
                build_end_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_build_times_type
                ON index_build_times(index_type, build_end_ms DESC);",
        )
        .map_err(|e| Error::operation("init_sqlite_schema", e))
    }

    /// Inserts a post, or updates the existing row with the same post id.
    ///
    /// A `row_id` of 0 lets the database assign one. Returns the row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn insert_post(&self, post: &Post) -> Result<RowId> {
        let start = Instant::now();
        let row_id = if post.row_id == 0 {
            None
        } else {
            Some(to_sql_id(post.row_id)?)
        };

        let result = {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                "INSERT INTO posts (row_id, post_id, author, created_at, subreddit, url,
                                    post_type, crosspost_parent, image_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(post_id) DO UPDATE SET
                    author = excluded.author,
                    created_at = excluded.created_at,
                    subreddit = excluded.subreddit,
                    url = excluded.url,
                    post_type = excluded.post_type,
                    crosspost_parent = excluded.crosspost_parent,
                    image_hash = COALESCE(excluded.image_hash, posts.image_hash)
                 RETURNING row_id",
                params![
                    row_id,
                    post.post_id.as_str(),
                    post.author,
                    post.created_at,
                    post.subreddit,
                    post.url,
                    post.post_type.as_str(),
                    post.crosspost_parent,
                    post.image_hash.as_ref().map(ImageHash::to_hex),
                ],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| Error::operation("insert_post", e))
            .and_then(|id| u64::try_from(id).map_err(|e| Error::operation("insert_post", e)))
        };

        record_operation("sqlite", "insert_post", start, &result);
        result
    }

    /// Stores a meme template, replacing one with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn add_meme_template(&self, template: &MemeTemplate) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO meme_templates (name, image_hash, tolerance, match_cutoff)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                image_hash = excluded.image_hash,
                tolerance = excluded.tolerance,
                match_cutoff = excluded.match_cutoff",
            params![
                template.name,
                template.hash.to_hex(),
                template.tolerance,
                template.match_cutoff,
            ],
        )
        .map(|_| ())
        .map_err(|e| Error::operation("add_meme_template", e))
    }

    fn query_page(&self, sql: &str, bind: [i64; 2]) -> Result<HashPage> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| Error::data_source("prepare_page_hashes", e))?;
        let raw = stmt
            .query_map(params_from_iter(bind), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::data_source("page_hashes", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::data_source("read_page_row", e))?;

        let mut page = HashPage {
            rows: Vec::with_capacity(raw.len()),
            scanned: raw.len(),
            last_row_id: None,
        };
        for (row_id, hex) in raw {
            let Ok(id) = u64::try_from(row_id) else {
                continue;
            };
            page.last_row_id = Some(id);
            if let Some(hash) = parse_stored_hash(row_id, &hex) {
                page.rows.push((id, hash));
            }
        }
        Ok(page)
    }

    fn query_post(&self, sql: &str, bind: impl rusqlite::Params) -> Result<Option<Post>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(sql, bind, PostRow::from_row)
            .optional()
            .map(|row| row.map(PostRow::into_post))
            .map_err(|e| Error::data_source("get_post", e))
    }
}

fn to_sql_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl HashStore for SqliteHashStore {
    #[instrument(skip(self), fields(backend = "sqlite"))]
    fn page_hashes(&self, offset: usize, limit: usize) -> Result<HashPage> {
        let start = Instant::now();
        let result = self.query_page(
            "SELECT row_id, image_hash FROM posts
             WHERE image_hash IS NOT NULL
             ORDER BY row_id
             LIMIT ?1 OFFSET ?2",
            [to_sql_limit(limit), to_sql_limit(offset)],
        );
        record_operation("sqlite", "page_hashes", start, &result);
        result
    }

    #[instrument(skip(self), fields(backend = "sqlite"))]
    fn page_hashes_after(&self, after: Option<RowId>, limit: usize) -> Result<HashPage> {
        let start = Instant::now();
        let after = after.map_or(Ok(i64::MIN), to_sql_id)?;
        let result = self.query_page(
            "SELECT row_id, image_hash FROM posts
             WHERE image_hash IS NOT NULL AND row_id > ?1
             ORDER BY row_id
             LIMIT ?2",
            [after, to_sql_limit(limit)],
        );
        record_operation("sqlite", "page_hashes_after", start, &result);
        result
    }

    fn count_hashes(&self) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE image_hash IS NOT NULL",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| usize::try_from(n).unwrap_or_default())
        .map_err(|e| Error::data_source("count_hashes", e))
    }

    fn get_post(&self, row_id: RowId) -> Result<Option<Post>> {
        let start = Instant::now();
        let result = self.query_post(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE row_id = ?1"),
            [to_sql_id(row_id)?],
        );
        record_operation("sqlite", "get_post", start, &result);
        result
    }

    #[instrument(skip(self, row_ids), fields(backend = "sqlite", count = row_ids.len()))]
    fn get_posts(&self, row_ids: &[RowId]) -> Result<Vec<Option<Post>>> {
        let start = Instant::now();
        let result = (|| {
            let ids = row_ids
                .iter()
                .map(|&id| to_sql_id(id))
                .collect::<Result<Vec<i64>>>()?;
            let mut found: HashMap<RowId, Post> = HashMap::with_capacity(ids.len());

            let conn = acquire_lock(&self.conn);
            for chunk in ids.chunks(BATCH_CHUNK) {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "SELECT {POST_COLUMNS} FROM posts WHERE row_id IN ({})",
                    placeholders.join(", ")
                );
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| Error::data_source("prepare_get_posts", e))?;
                let rows = stmt
                    .query_map(params_from_iter(chunk.iter()), PostRow::from_row)
                    .map_err(|e| Error::data_source("get_posts", e))?;
                for row in rows {
                    let post = row
                        .map_err(|e| Error::data_source("read_post_row", e))?
                        .into_post();
                    found.insert(post.row_id, post);
                }
            }

            Ok(row_ids.iter().map(|id| found.remove(id)).collect())
        })();
        record_operation("sqlite", "get_posts", start, &result);
        result
    }

    fn get_post_by_post_id(&self, post_id: &PostId) -> Result<Option<Post>> {
        let start = Instant::now();
        let result = self.query_post(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE post_id = ?1"),
            [post_id.as_str()],
        );
        record_operation("sqlite", "get_post_by_post_id", start, &result);
        result
    }

    fn update_hash(&self, row_id: RowId, hash: &ImageHash) -> Result<()> {
        let start = Instant::now();
        let result = (|| {
            let conn = acquire_lock(&self.conn);
            let changed = conn
                .execute(
                    "UPDATE posts SET image_hash = ?1 WHERE row_id = ?2",
                    params![hash.to_hex(), to_sql_id(row_id)?],
                )
                .map_err(|e| Error::operation("update_hash", e))?;
            if changed == 0 {
                return Err(Error::InvalidInput(format!("no post with row id {row_id}")));
            }
            Ok(())
        })();
        record_operation("sqlite", "update_hash", start, &result);
        result
    }

    fn meme_templates(&self) -> Result<Vec<MemeTemplate>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare_cached(
                "SELECT name, image_hash, tolerance, match_cutoff FROM meme_templates ORDER BY id",
            )
            .map_err(|e| Error::data_source("prepare_meme_templates", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<u32>>(3)?,
                ))
            })
            .map_err(|e| Error::data_source("meme_templates", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::data_source("read_meme_template", e))?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, hex, tolerance, match_cutoff)| {
                ImageHash::from_hex(&hex).ok().map(|hash| MemeTemplate {
                    name,
                    hash,
                    tolerance,
                    match_cutoff,
                })
            })
            .collect())
    }
}

impl BuildLog for SqliteHashStore {
    fn record_build(&self, record: &BuildRecord) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO index_build_times
                (index_type, hostname, item_count, build_start_ms, build_end_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.index_type,
                record.hostname,
                to_sql_limit(record.item_count),
                record.build_start.timestamp_millis(),
                record.build_end.timestamp_millis(),
            ],
        )
        .map(|_| ())
        .map_err(|e| Error::operation("record_build", e))
    }

    fn last_build(&self, index_type: &str) -> Result<Option<BuildRecord>> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT index_type, hostname, item_count, build_start_ms, build_end_ms
             FROM index_build_times
             WHERE index_type = ?1
             ORDER BY build_end_ms DESC, id DESC
             LIMIT 1",
            [index_type],
            |row| {
                Ok(BuildRecord {
                    index_type: row.get(0)?,
                    hostname: row.get(1)?,
                    item_count: usize::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
                    build_start: millis_to_datetime(row.get(3)?),
                    build_end: millis_to_datetime(row.get(4)?),
                })
            },
        )
        .optional()
        .map_err(|e| Error::data_source("last_build", e))
    }
}
