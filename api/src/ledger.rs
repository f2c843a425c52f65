//! One vote per (comment, user), with toggle-off on a repeated direction.
//!
//! The transition table is a pure function; [`apply`] runs it against the
//! `comment_votes` table inside a single `IMMEDIATE` transaction, so the tally
//! it returns always reflects the mutation it just made.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteIntent {
    Up,
    Down,
    Clear,
}

impl From<Option<bool>> for VoteIntent {
    fn from(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Up,
            Some(false) => Self::Down,
            None => Self::Clear,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    NoVote,
    Upvoted,
    Downvoted,
}

impl VoteState {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Upvoted,
            Some(false) => Self::Downvoted,
            None => Self::NoVote,
        }
    }

    pub fn as_flag(self) -> Option<bool> {
        match self {
            Self::Upvoted => Some(true),
            Self::Downvoted => Some(false),
            Self::NoVote => None,
        }
    }
}

/// The row operation a transition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Insert(bool),
    Update(bool),
    Delete,
    Noop,
}

pub fn transition(current: VoteState, intent: VoteIntent) -> (VoteState, LedgerOp) {
    use VoteIntent::*;
    use VoteState::*;

    match (current, intent) {
        (NoVote, Up) => (Upvoted, LedgerOp::Insert(true)),
        (NoVote, Down) => (Downvoted, LedgerOp::Insert(false)),
        (NoVote, Clear) => (NoVote, LedgerOp::Noop),
        // Same direction again toggles the vote off.
        (Upvoted, Up) | (Downvoted, Down) => (NoVote, LedgerOp::Delete),
        (Upvoted, Down) => (Downvoted, LedgerOp::Update(false)),
        (Downvoted, Up) => (Upvoted, LedgerOp::Update(true)),
        (Upvoted | Downvoted, Clear) => (NoVote, LedgerOp::Delete),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub up: i64,
    pub down: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Post the comment belongs to, read in the same transaction as the vote.
    pub post_id: i64,
    pub state: VoteState,
    pub tally: Tally,
}

/// Applies `intent` for `actor` on `comment_id` and returns the caller's new
/// state together with the fresh tally.
///
/// A missing comment is reported before a missing actor.
pub fn apply(
    conn: &mut Connection,
    comment_id: i64,
    actor: Option<i64>,
    intent: VoteIntent,
) -> Result<Outcome, AppError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let post_id = post_of(&tx, comment_id)?.ok_or(AppError::NotFound("Comment"))?;
    let user_id = actor.ok_or(AppError::Unauthorized("Sign in to vote"))?;

    let current = state_of(&tx, comment_id, user_id)?;
    let (next, op) = transition(current, intent);

    match op {
        LedgerOp::Insert(up) => {
            // Upsert: a stale NULL row counts as no vote but still holds the slot.
            tx.execute(
                "INSERT INTO comment_votes (comment_id, user_id, is_up_vote) VALUES (?1, ?2, ?3)
                 ON CONFLICT(comment_id, user_id) DO UPDATE SET is_up_vote = excluded.is_up_vote",
                params![comment_id, user_id, up],
            )?;
        }
        LedgerOp::Update(up) => {
            tx.execute(
                "UPDATE comment_votes SET is_up_vote = ?3 WHERE comment_id = ?1 AND user_id = ?2",
                params![comment_id, user_id, up],
            )?;
        }
        LedgerOp::Delete => {
            tx.execute(
                "DELETE FROM comment_votes WHERE comment_id = ?1 AND user_id = ?2",
                params![comment_id, user_id],
            )?;
        }
        LedgerOp::Noop => {}
    }

    let tally = tally(&tx, comment_id)?;
    tx.commit()?;

    tracing::debug!(comment_id, user_id, ?op, ?next, "vote applied");
    Ok(Outcome {
        post_id,
        state: next,
        tally,
    })
}

pub fn post_of(conn: &Connection, comment_id: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT post_id FROM comments WHERE id = ?1", [comment_id], |row| row.get(0))
        .optional()
}

pub fn comment_exists(conn: &Connection, comment_id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM comments WHERE id = ?1)",
        [comment_id],
        |row| row.get(0),
    )
}

/// The caller's current state. A row holding NULL counts as no vote.
pub fn state_of(conn: &Connection, comment_id: i64, user_id: i64) -> rusqlite::Result<VoteState> {
    let flag: Option<Option<bool>> = conn
        .query_row(
            "SELECT is_up_vote FROM comment_votes WHERE comment_id = ?1 AND user_id = ?2",
            params![comment_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(VoteState::from_flag(flag.flatten()))
}

pub fn tally(conn: &Connection, comment_id: i64) -> rusqlite::Result<Tally> {
    let mut stmt = conn.prepare(
        "SELECT is_up_vote, COUNT(*) FROM comment_votes
         WHERE comment_id = ?1 AND is_up_vote IS NOT NULL
         GROUP BY is_up_vote",
    )?;
    let rows = stmt.query_map([comment_id], |row| {
        Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut tally = Tally::default();
    for row in rows {
        match row? {
            (true, n) => tally.up = n,
            (false, n) => tally.down = n,
        }
    }
    Ok(tally)
}

/// Tallies for every comment on a post that has at least one vote.
pub fn tallies_for_post(conn: &Connection, post_id: i64) -> rusqlite::Result<HashMap<i64, Tally>> {
    let mut stmt = conn.prepare(
        "SELECT v.comment_id,
                COALESCE(SUM(v.is_up_vote = 1), 0),
                COALESCE(SUM(v.is_up_vote = 0), 0)
         FROM comment_votes v
         JOIN comments c ON c.id = v.comment_id
         WHERE c.post_id = ?1
         GROUP BY v.comment_id",
    )?;
    let rows = stmt.query_map([post_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Tally {
                up: row.get(1)?,
                down: row.get(2)?,
            },
        ))
    })?;
    rows.collect()
}
