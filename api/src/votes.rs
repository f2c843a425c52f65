use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use blog_shared::{CommentVote, VotePayload};

use crate::{
    auth::MaybeActor,
    cache::keys,
    db,
    error::{respond, AppError},
    extract::{Json, Path},
    ledger::{self, VoteIntent, VoteState},
    AppState,
};

/// GET /api/comments/{id}/votes
pub async fn get_votes(
    State(state): State<AppState>,
    Path(comment_id): Path<i64>,
    MaybeActor(actor): MaybeActor,
) -> Result<impl IntoResponse, AppError> {
    let user_id = actor.map(|a| a.id);

    let vote = db::run(&state.db, move |conn| {
        if !ledger::comment_exists(conn, comment_id)? {
            return Err(AppError::NotFound("Comment"));
        }
        let tally = ledger::tally(conn, comment_id)?;
        let mine = match user_id {
            Some(uid) => ledger::state_of(conn, comment_id, uid)?,
            None => VoteState::NoVote,
        };
        Ok(CommentVote {
            comment_id,
            is_up_vote: mine.as_flag(),
            upvote_count: tally.up,
            downvote_count: tally.down,
        })
    })
    .await?;

    Ok(respond(StatusCode::OK, vote, "Votes retrieved successfully"))
}

/// POST /api/comments/{id}/vote. Repeating the current direction clears it.
pub async fn cast_vote(
    State(state): State<AppState>,
    Path(comment_id): Path<i64>,
    MaybeActor(actor): MaybeActor,
    Json(payload): Json<VotePayload>,
) -> Result<impl IntoResponse, AppError> {
    let intent = VoteIntent::from(payload.is_up_vote);
    let user_id = actor.map(|a| a.id);

    let outcome = db::run(&state.db, move |conn| ledger::apply(conn, comment_id, user_id, intent)).await?;

    state
        .cache
        .remove_all([keys::comment(comment_id), keys::post(outcome.post_id)])
        .await;
    tracing::info!(comment_id, ?intent, state = ?outcome.state, "vote recorded");

    let vote = CommentVote {
        comment_id,
        is_up_vote: outcome.state.as_flag(),
        upvote_count: outcome.tally.up,
        downvote_count: outcome.tally.down,
    };
    Ok(respond(StatusCode::OK, vote, "Vote recorded successfully"))
}
