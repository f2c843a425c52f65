use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blog_shared::{CreatePost, Post, PostDetail, UpdatePost};
use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::{
    auth::Actor,
    cache::keys,
    comments, db,
    error::{respond, AppError},
    extract::{Json, Path, Query},
    images,
    jobs::Job,
    mailer,
    paging::{ListParams, Listable, SortKey},
    AppState,
};

// ── Listing ──

impl Listable for Post {
    fn search_fields(&self) -> Vec<&str> {
        vec![&self.title, &self.content]
    }

    fn published_on(&self) -> NaiveDateTime {
        self.published_on
    }

    fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.to_lowercase();
        self.tags.iter().any(|t| t.to_lowercase() == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSort {
    Title,
    PublishedOn,
    DateModified,
    Author,
    Id,
}

impl SortKey<Post> for PostSort {
    const DEFAULT: Self = PostSort::Title;

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "title" => Some(Self::Title),
            "publishedon" => Some(Self::PublishedOn),
            "datemodified" => Some(Self::DateModified),
            "author" => Some(Self::Author),
            "id" => Some(Self::Id),
            _ => None,
        }
    }

    fn compare(self, a: &Post, b: &Post) -> Ordering {
        match self {
            Self::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            Self::PublishedOn => a.published_on.cmp(&b.published_on),
            Self::DateModified => a.date_modified.cmp(&b.date_modified),
            Self::Author => a.author.to_lowercase().cmp(&b.author.to_lowercase()),
            Self::Id => a.id.cmp(&b.id),
        }
    }
}

/// Which posts a base set holds.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope {
    All,
    ByUser(i64),
    WithTag(i64),
    One(i64),
}

pub(crate) fn load_posts(conn: &Connection, scope: Scope) -> rusqlite::Result<Vec<Post>> {
    let (filter, arg) = match scope {
        Scope::All => ("", None),
        Scope::ByUser(id) => ("WHERE p.user_id = ?1", Some(id)),
        Scope::WithTag(id) => (
            "WHERE p.id IN (SELECT post_id FROM post_tags WHERE tag_id = ?1)",
            Some(id),
        ),
        Scope::One(id) => ("WHERE p.id = ?1", Some(id)),
    };
    let sql = format!(
        "SELECT p.id, p.title, p.content, p.author, p.image_url, p.published_on, p.date_modified
         FROM posts p {filter}"
    );

    let mut tags = tag_names(conn, matches!(scope, Scope::One(_)).then_some(arg).flatten())?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(arg), |row| {
        Ok(Post {
            id: row.get(0)?,
            title: row.get(1)?,
            content: row.get(2)?,
            author: row.get(3)?,
            tags: Vec::new(),
            post_image_url: row.get(4)?,
            published_on: row.get(5)?,
            date_modified: row.get(6)?,
        })
    })?;

    let mut posts = Vec::new();
    for row in rows {
        let mut post = row?;
        post.tags = tags.remove(&post.id).unwrap_or_default();
        posts.push(post);
    }
    Ok(posts)
}

fn tag_names(conn: &Connection, post_id: Option<i64>) -> rusqlite::Result<HashMap<i64, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT pt.post_id, t.name FROM post_tags pt
         JOIN tags t ON t.id = pt.tag_id
         WHERE ?1 IS NULL OR pt.post_id = ?1
         ORDER BY t.name COLLATE NOCASE",
    )?;
    let rows = stmt.query_map([post_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

    let mut names: HashMap<i64, Vec<String>> = HashMap::new();
    for row in rows {
        let (post_id, name) = row?;
        names.entry(post_id).or_default().push(name);
    }
    Ok(names)
}

pub(crate) fn load_post(conn: &Connection, id: i64) -> Result<Post, AppError> {
    load_posts(conn, Scope::One(id))?
        .pop()
        .ok_or(AppError::NotFound("Post"))
}

fn load_detail(conn: &Connection, id: i64) -> Result<PostDetail, AppError> {
    let post = load_post(conn, id)?;
    let comments = comments::load_for_post(conn, id)?;
    Ok(PostDetail { post, comments })
}

/// The owner of a post, failing when the post does not exist.
pub(crate) fn owner_of(conn: &Connection, post_id: i64) -> Result<Option<i64>, AppError> {
    conn.query_row("SELECT user_id FROM posts WHERE id = ?1", [post_id], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .optional()?
    .ok_or(AppError::NotFound("Post"))
}

/// Sanitises user-supplied HTML and rejects blank results.
pub(crate) fn clean_field(field: &str, label: &str, raw: &str) -> Result<String, AppError> {
    let cleaned = ammonia::clean(raw.trim());
    if cleaned.trim().is_empty() {
        return Err(AppError::invalid(field, format!("{label} is required")));
    }
    Ok(cleaned)
}

fn link_tags(conn: &Connection, post_id: i64, tag_ids: &[i64]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO post_tags (post_id, tag_id) SELECT ?1, id FROM tags WHERE id = ?2",
    )?;
    for tag_id in tag_ids {
        stmt.execute(params![post_id, tag_id])?;
    }
    Ok(())
}

fn ttl(state: &AppState) -> Duration {
    Duration::from_secs(state.config.cache_ttl_secs)
}

// ── Handlers ──

/// GET /api/posts
pub async fn list_posts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let query = params.into_query::<Post, PostSort>(state.config.max_page_size)?;
    let posts = db::run(&state.db, |conn| Ok(load_posts(conn, Scope::All)?)).await?;
    Ok(query.run(posts).respond("Posts retrieved successfully"))
}

/// GET /api/posts/user-posts
pub async fn user_posts(
    State(state): State<AppState>,
    actor: Actor,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let query = params.into_query::<Post, PostSort>(state.config.max_page_size)?;
    let posts = db::run(&state.db, move |conn| {
        Ok(load_posts(conn, Scope::ByUser(actor.id))?)
    })
    .await?;
    Ok(query.run(posts).respond("Posts retrieved successfully"))
}

/// GET /api/posts/{id}
pub async fn get_post(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let pool = state.db.clone();
    let detail = state
        .cache
        .get_or_load(&keys::post(id), ttl(&state), || {
            db::run(&pool, move |conn| load_detail(conn, id))
        })
        .await?;
    Ok(respond(StatusCode::OK, detail, "Post retrieved successfully"))
}

/// POST /api/posts
pub async fn create_post(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreatePost>,
) -> Result<impl IntoResponse, AppError> {
    let title = clean_field("title", "Title", &body.title)?;
    let content = clean_field("content", "Content", &body.content)?;

    let author = actor.name.clone();
    let user_id = actor.id;
    let post = db::run(&state.db, move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO posts (user_id, title, content, author) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, title, content, author],
        )?;
        let post_id = tx.last_insert_rowid();
        link_tags(&tx, post_id, &body.tag_ids)?;
        let post = load_post(&tx, post_id)?;
        tx.commit()?;
        Ok(post)
    })
    .await?;

    tracing::info!(post_id = post.id, user_id = actor.id, "post created");

    let link = format!(
        "{}/api/posts/{}",
        state.config.public_url.trim_end_matches('/'),
        post.id
    );
    state.jobs.enqueue(Job::SendEmail(mailer::new_post_notification(
        &actor.email,
        &actor.name,
        &post.title,
        &link,
    )));

    Ok(respond(StatusCode::CREATED, post, "Post created successfully"))
}

/// PATCH /api/posts/{id}
pub async fn update_post(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
    Json(body): Json<UpdatePost>,
) -> Result<impl IntoResponse, AppError> {
    let title = body
        .title
        .as_deref()
        .map(|t| clean_field("title", "Title", t))
        .transpose()?;
    let content = body
        .content
        .as_deref()
        .map(|c| clean_field("content", "Content", c))
        .transpose()?;

    let post = db::run(&state.db, move |conn| {
        let tx = conn.transaction()?;
        actor.require_owner(owner_of(&tx, id)?)?;

        tx.execute(
            "UPDATE posts SET title = COALESCE(?2, title), content = COALESCE(?3, content),
                 date_modified = datetime('now')
             WHERE id = ?1",
            params![id, title, content],
        )?;
        if let Some(tag_ids) = &body.tag_ids {
            tx.execute("DELETE FROM post_tags WHERE post_id = ?1", [id])?;
            link_tags(&tx, id, tag_ids)?;
        }
        let post = load_post(&tx, id)?;
        tx.commit()?;
        Ok(post)
    })
    .await?;

    state.cache.remove(&keys::post(id)).await;
    tracing::info!(post_id = id, "post updated");
    Ok(respond(StatusCode::OK, post, "Post updated successfully"))
}

fn bad_upload(e: MultipartError) -> AppError {
    AppError::invalid("coverImage", e.body_text())
}

/// PATCH /api/posts/{id}/cover-image
pub async fn update_cover_image(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let old_image = db::run(&state.db, move |conn| {
        actor.require_owner(owner_of(conn, id)?)?;
        Ok(conn.query_row("SELECT image_public_id FROM posts WHERE id = ?1", [id], |row| {
            row.get::<_, Option<String>>(0)
        })?)
    })
    .await?;

    let mut multipart = multipart?;
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_upload)? {
        if field.name() == Some("coverImage") {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(bad_upload)?;
            upload = Some((file_name, bytes));
        }
    }
    let (file_name, bytes) =
        upload.ok_or_else(|| AppError::invalid("coverImage", "No image was supplied"))?;
    images::validate_image(&file_name, bytes.len())?;

    if let Some(public_id) = old_image {
        if let Err(e) = state.images.delete(&public_id).await {
            tracing::warn!(post_id = id, public_id = %public_id, error = %e, "could not delete previous cover image");
        }
    }
    let image = state.images.upload(bytes.to_vec(), &file_name).await?;

    let post = db::run(&state.db, move |conn| {
        conn.execute(
            "UPDATE posts SET image_url = ?2, image_public_id = ?3, image_format = ?4,
                 date_modified = datetime('now')
             WHERE id = ?1",
            params![id, image.url, image.public_id, image.format],
        )?;
        load_post(conn, id)
    })
    .await?;

    state.cache.remove(&keys::post(id)).await;
    tracing::info!(post_id = id, "cover image replaced");
    Ok(respond(StatusCode::OK, post, "Cover image updated successfully"))
}

/// DELETE /api/posts/{id}
pub async fn delete_post(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let (comment_ids, image) = db::run(&state.db, move |conn| {
        let tx = conn.transaction()?;
        actor.require_owner(owner_of(&tx, id)?)?;

        let image: Option<String> = tx.query_row(
            "SELECT image_public_id FROM posts WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        let comment_ids = {
            let mut stmt = tx.prepare("SELECT id FROM comments WHERE post_id = ?1")?;
            let ids = stmt
                .query_map([id], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        tx.execute("DELETE FROM posts WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok((comment_ids, image))
    })
    .await?;

    state.cache.remove(&keys::post(id)).await;
    state
        .cache
        .remove_all(comment_ids.iter().copied().map(keys::comment))
        .await;
    if let Some(public_id) = image {
        state.jobs.enqueue(Job::DeleteImage { public_id });
    }

    tracing::info!(post_id = id, "post deleted");
    Ok(respond(StatusCode::OK, (), "Post deleted successfully"))
}
