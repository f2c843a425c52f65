use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::AppError;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Opens a file-backed pool. Every connection enforces foreign keys.
pub fn open(database_url: &str) -> Result<DbPool, AppError> {
    let manager = SqliteConnectionManager::file(database_url).with_init(init_connection);
    let pool = r2d2::Pool::new(manager)?;
    migrate(&*pool.get()?)?;
    Ok(pool)
}

/// A single-connection in-memory pool. Used by tests, where every connection
/// to `:memory:` would otherwise see a different database.
pub fn open_in_memory() -> Result<DbPool, AppError> {
    let manager = SqliteConnectionManager::memory().with_init(init_connection);
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    migrate(&*pool.get()?)?;
    Ok(pool)
}

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
}

/// Runs `f` against a pooled connection on the blocking thread pool.
pub async fn run<T, F>(pool: &DbPool, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            user_name             TEXT NOT NULL UNIQUE COLLATE NOCASE,
            email                 TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash         TEXT NOT NULL,
            first_name            TEXT NOT NULL DEFAULT '',
            last_name             TEXT NOT NULL DEFAULT '',
            phone_country_code    TEXT,
            phone_number          TEXT,
            email_confirmed       INTEGER NOT NULL DEFAULT 0,
            confirmation_token    TEXT,
            refresh_token         TEXT,
            refresh_token_expiry  TEXT,
            reset_token           TEXT,
            reset_token_expiry    TEXT,
            pending_email         TEXT,
            email_change_token    TEXT,
            date_created          TEXT NOT NULL DEFAULT (datetime('now')),
            date_modified         TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS user_roles (
            user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role        TEXT NOT NULL,
            PRIMARY KEY (user_id, role)
        );

        CREATE TABLE IF NOT EXISTS posts (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER REFERENCES users(id) ON DELETE SET NULL,
            title            TEXT NOT NULL,
            content          TEXT NOT NULL,
            author           TEXT NOT NULL,
            image_url        TEXT,
            image_public_id  TEXT,
            image_format     TEXT,
            published_on     TEXT NOT NULL DEFAULT (datetime('now')),
            date_modified    TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_posts_user ON posts(user_id);

        CREATE TABLE IF NOT EXISTS tags (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE COLLATE NOCASE
        );

        CREATE TABLE IF NOT EXISTS post_tags (
            post_id     INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            tag_id      INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (post_id, tag_id)
        );
        CREATE INDEX IF NOT EXISTS idx_post_tags_tag ON post_tags(tag_id);

        CREATE TABLE IF NOT EXISTS comments (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id        INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            user_id        INTEGER REFERENCES users(id) ON DELETE SET NULL,
            author         TEXT NOT NULL,
            content        TEXT NOT NULL,
            published_on   TEXT NOT NULL DEFAULT (datetime('now')),
            date_modified  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id);

        CREATE TABLE IF NOT EXISTS comment_votes (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            comment_id   INTEGER NOT NULL REFERENCES comments(id) ON DELETE CASCADE,
            user_id      INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            is_up_vote   INTEGER,
            UNIQUE(comment_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_comment_votes_comment ON comment_votes(comment_id);
        ",
    )
}
