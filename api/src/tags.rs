use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blog_shared::{Post, Tag, TagName};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    auth::Actor,
    cache::keys,
    db,
    error::{respond, AppError},
    extract::{Json, Path, Query},
    paging::ListParams,
    posts::{self, PostSort, Scope},
    AppState,
};

const DUPLICATE: &str = "Tag already exists";

fn load_tags(conn: &Connection) -> rusqlite::Result<Vec<Tag>> {
    let mut stmt = conn.prepare("SELECT id, name FROM tags ORDER BY name COLLATE NOCASE")?;
    let rows = stmt.query_map([], |row| {
        Ok(Tag {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    rows.collect()
}

fn load_tag(conn: &Connection, id: i64) -> Result<Tag, AppError> {
    conn.query_row("SELECT id, name FROM tags WHERE id = ?1", [id], |row| {
        Ok(Tag {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })
    .optional()?
    .ok_or(AppError::NotFound("Tag"))
}

/// Fails with `Conflict` when another tag already uses `name`, ignoring case.
fn ensure_unique(conn: &Connection, name: &str, except: Option<i64>) -> Result<(), AppError> {
    let taken: Option<i64> = conn
        .query_row(
            "SELECT id FROM tags WHERE name = ?1 COLLATE NOCASE AND (?2 IS NULL OR id <> ?2)",
            params![name, except],
            |row| row.get(0),
        )
        .optional()?;
    match taken {
        Some(_) => Err(AppError::Conflict(DUPLICATE.into())),
        None => Ok(()),
    }
}

fn linked_posts(conn: &Connection, tag_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT post_id FROM post_tags WHERE tag_id = ?1")?;
    let ids = stmt.query_map([tag_id], |row| row.get::<_, i64>(0))?;
    ids.collect()
}

fn tag_name(body: &TagName) -> Result<String, AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::invalid("name", "Tag name is required"));
    }
    Ok(name.to_string())
}

fn ttl(state: &AppState) -> Duration {
    Duration::from_secs(state.config.cache_ttl_secs)
}

async fn invalidate(state: &AppState, tag_id: i64, post_ids: &[i64]) {
    state
        .cache
        .remove_all(
            [keys::TAGS.to_string(), keys::tag(tag_id)]
                .into_iter()
                .chain(post_ids.iter().copied().map(keys::post)),
        )
        .await;
}

/// GET /api/tags
pub async fn list_tags(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let pool = state.db.clone();
    let tags = state
        .cache
        .get_or_load(keys::TAGS, ttl(&state), || {
            db::run(&pool, |conn| Ok(load_tags(conn)?))
        })
        .await?;
    Ok(respond(StatusCode::OK, tags, "Tags retrieved successfully"))
}

/// GET /api/tags/{id}
pub async fn get_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let pool = state.db.clone();
    let tag = state
        .cache
        .get_or_load(&keys::tag(id), ttl(&state), || {
            db::run(&pool, move |conn| load_tag(conn, id))
        })
        .await?;
    Ok(respond(StatusCode::OK, tag, "Tag retrieved successfully"))
}

/// GET /api/tags/{id}/posts
pub async fn tag_posts(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let query = params.into_query::<Post, PostSort>(state.config.max_page_size)?;
    let posts = db::run(&state.db, move |conn| {
        load_tag(conn, id)?;
        Ok(posts::load_posts(conn, Scope::WithTag(id))?)
    })
    .await?;
    Ok(query.run(posts).respond("Posts retrieved successfully"))
}

/// POST /api/tags
pub async fn create_tag(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<TagName>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    let name = tag_name(&body)?;

    let tag = db::run(&state.db, move |conn| {
        ensure_unique(conn, &name, None)?;
        conn.execute("INSERT INTO tags (name) VALUES (?1)", [&name])
            .map_err(|e| AppError::on_unique(e, DUPLICATE))?;
        Ok(Tag {
            id: conn.last_insert_rowid(),
            name,
        })
    })
    .await?;

    state.cache.remove(keys::TAGS).await;
    tracing::info!(tag_id = tag.id, name = %tag.name, "tag created");
    Ok(respond(StatusCode::CREATED, tag, "Tag created successfully"))
}

/// PUT /api/tags/{id}
pub async fn update_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
    Json(body): Json<TagName>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    let name = tag_name(&body)?;

    let (tag, post_ids) = db::run(&state.db, move |conn| {
        load_tag(conn, id)?;
        ensure_unique(conn, &name, Some(id))?;
        conn.execute("UPDATE tags SET name = ?2 WHERE id = ?1", params![id, name])
            .map_err(|e| AppError::on_unique(e, DUPLICATE))?;
        Ok((Tag { id, name }, linked_posts(conn, id)?))
    })
    .await?;

    invalidate(&state, id, &post_ids).await;
    tracing::info!(tag_id = id, name = %tag.name, "tag renamed");
    Ok(respond(StatusCode::OK, tag, "Tag updated successfully"))
}

/// DELETE /api/tags/{id}
pub async fn delete_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;

    let post_ids = db::run(&state.db, move |conn| {
        load_tag(conn, id)?;
        let post_ids = linked_posts(conn, id)?;
        conn.execute("DELETE FROM tags WHERE id = ?1", [id])?;
        Ok(post_ids)
    })
    .await?;

    invalidate(&state, id, &post_ids).await;
    tracing::info!(tag_id = id, "tag deleted");
    Ok(respond(StatusCode::OK, (), "Tag deleted successfully"))
}
