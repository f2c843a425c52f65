use std::cmp::Ordering;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blog_shared::{Comment, CreateComment, UpdateComment};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    auth::{Actor, MaybeActor},
    cache::keys,
    db,
    error::{respond, AppError},
    extract::{Json, Path, Query},
    ledger,
    paging::{ListParams, Listable, SortKey},
    posts, AppState,
};

pub const ANONYMOUS: &str = "Anonymous";

impl Listable for Comment {
    fn search_fields(&self) -> Vec<&str> {
        vec![&self.content, &self.author]
    }

    fn published_on(&self) -> NaiveDateTime {
        self.published_on
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentSort {
    PublishedOn,
    Author,
    UpVotes,
    DownVotes,
}

impl SortKey<Comment> for CommentSort {
    const DEFAULT: Self = CommentSort::PublishedOn;

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "publishedon" => Some(Self::PublishedOn),
            "author" => Some(Self::Author),
            "upvotecount" => Some(Self::UpVotes),
            "downvotecount" => Some(Self::DownVotes),
            _ => None,
        }
    }

    fn compare(self, a: &Comment, b: &Comment) -> Ordering {
        match self {
            Self::PublishedOn => a.published_on.cmp(&b.published_on),
            Self::Author => a.author.to_lowercase().cmp(&b.author.to_lowercase()),
            Self::UpVotes => a.up_vote_count.cmp(&b.up_vote_count),
            Self::DownVotes => a.down_vote_count.cmp(&b.down_vote_count),
        }
    }
}

const COMMENT_COLUMNS: &str = "id, post_id, content, author, published_on, date_modified";

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        post_id: row.get(1)?,
        content: row.get(2)?,
        author: row.get(3)?,
        up_vote_count: 0,
        down_vote_count: 0,
        published_on: row.get(4)?,
        date_modified: row.get(5)?,
    })
}

/// Every comment on a post, oldest first, with tallies from the ledger.
pub(crate) fn load_for_post(conn: &Connection, post_id: i64) -> rusqlite::Result<Vec<Comment>> {
    let tallies = ledger::tallies_for_post(conn, post_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMMENT_COLUMNS} FROM comments WHERE post_id = ?1 ORDER BY published_on, id"
    ))?;
    let rows = stmt.query_map([post_id], comment_from_row)?;

    let mut comments = Vec::new();
    for row in rows {
        let mut comment = row?;
        if let Some(tally) = tallies.get(&comment.id) {
            comment.up_vote_count = tally.up;
            comment.down_vote_count = tally.down;
        }
        comments.push(comment);
    }
    Ok(comments)
}

pub(crate) fn load_comment(conn: &Connection, id: i64) -> Result<Comment, AppError> {
    let mut comment = conn
        .query_row(
            &format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?1"),
            [id],
            comment_from_row,
        )
        .optional()?
        .ok_or(AppError::NotFound("Comment"))?;
    let tally = ledger::tally(conn, id)?;
    comment.up_vote_count = tally.up;
    comment.down_vote_count = tally.down;
    Ok(comment)
}

/// The comment's author, the post's owner and administrators may change a comment.
/// Returns the post id.
fn authorize(conn: &Connection, actor: &Actor, comment_id: i64) -> Result<i64, AppError> {
    let (post_id, author_id, post_owner): (i64, Option<i64>, Option<i64>) = conn
        .query_row(
            "SELECT c.post_id, c.user_id, p.user_id FROM comments c
             JOIN posts p ON p.id = c.post_id
             WHERE c.id = ?1",
            [comment_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or(AppError::NotFound("Comment"))?;

    if actor.is_admin() || author_id == Some(actor.id) || post_owner == Some(actor.id) {
        Ok(post_id)
    } else {
        Err(AppError::Forbidden)
    }
}

fn ttl(state: &AppState) -> Duration {
    Duration::from_secs(state.config.comment_cache_ttl_secs)
}

/// GET /api/posts/{id}/comments
pub async fn list_comments(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let query = params.into_query::<Comment, CommentSort>(state.config.max_page_size)?;
    let comments = db::run(&state.db, move |conn| {
        posts::owner_of(conn, post_id)?;
        Ok(load_for_post(conn, post_id)?)
    })
    .await?;
    Ok(query.run(comments).respond("Comments retrieved successfully"))
}

/// POST /api/posts/{id}/comments
pub async fn create_comment(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
    MaybeActor(actor): MaybeActor,
    Json(body): Json<CreateComment>,
) -> Result<impl IntoResponse, AppError> {
    let content = posts::clean_field("content", "Content", &body.content)?;
    let (user_id, author) = match &actor {
        Some(actor) => (Some(actor.id), actor.name.clone()),
        None => (None, ANONYMOUS.to_string()),
    };

    let comment = db::run(&state.db, move |conn| {
        posts::owner_of(conn, post_id)?;
        conn.execute(
            "INSERT INTO comments (post_id, user_id, author, content) VALUES (?1, ?2, ?3, ?4)",
            params![post_id, user_id, author, content],
        )?;
        load_comment(conn, conn.last_insert_rowid())
    })
    .await?;

    state.cache.remove(&keys::post(post_id)).await;
    tracing::info!(comment_id = comment.id, post_id, "comment created");
    Ok(respond(StatusCode::CREATED, comment, "Comment created successfully"))
}

/// GET /api/comments/{id}
pub async fn get_comment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let pool = state.db.clone();
    let comment = state
        .cache
        .get_or_load(&keys::comment(id), ttl(&state), || {
            db::run(&pool, move |conn| load_comment(conn, id))
        })
        .await?;
    Ok(respond(StatusCode::OK, comment, "Comment retrieved successfully"))
}

/// PUT /api/comments/{id}
pub async fn update_comment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
    Json(body): Json<UpdateComment>,
) -> Result<impl IntoResponse, AppError> {
    let content = posts::clean_field("content", "Content", &body.content)?;

    let comment = db::run(&state.db, move |conn| {
        authorize(conn, &actor, id)?;
        conn.execute(
            "UPDATE comments SET content = ?2, date_modified = datetime('now') WHERE id = ?1",
            params![id, content],
        )?;
        load_comment(conn, id)
    })
    .await?;

    state
        .cache
        .remove_all([keys::comment(id), keys::post(comment.post_id)])
        .await;
    tracing::info!(comment_id = id, "comment updated");
    Ok(respond(StatusCode::OK, comment, "Comment updated successfully"))
}

/// DELETE /api/comments/{id}
pub async fn delete_comment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let post_id = db::run(&state.db, move |conn| {
        let post_id = authorize(conn, &actor, id)?;
        conn.execute("DELETE FROM comments WHERE id = ?1", [id])?;
        Ok(post_id)
    })
    .await?;

    state
        .cache
        .remove_all([keys::comment(id), keys::post(post_id)])
        .await;
    tracing::info!(comment_id = id, post_id, "comment deleted");
    Ok(respond(StatusCode::OK, (), "Comment deleted successfully"))
}
