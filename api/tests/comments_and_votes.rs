mod common;

use axum::http::{Method, StatusCode};
use blog_api::cache::keys;
use blog_shared::{Comment, PostDetail};
use common::TestApp;
use serde_json::{json, Value};

async fn vote(t: &TestApp, token: Option<&str>, comment_id: i64, is_up_vote: Value) -> common::Reply {
    t.post(
        &format!("/api/comments/{comment_id}/vote"),
        token,
        json!({ "isUpVote": is_up_vote }),
    )
    .await
}

#[tokio::test]
async fn up_up_down_ends_as_single_downvote() {
    let t = TestApp::new().await;
    let alice = t.sign_up("alice", "alice@example.com").await;
    let post_id = t.create_post(&alice, "Votes", &[]).await;
    let comment_id = t.create_comment(Some(&alice), post_id, "vote on me").await;

    let first = vote(&t, Some(&alice), comment_id, json!(true)).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.data()["isUpVote"], true);
    assert_eq!(first.data()["upvoteCount"], 1);

    let second = vote(&t, Some(&alice), comment_id, json!(true)).await;
    assert_eq!(second.data()["isUpVote"], Value::Null);
    assert_eq!(second.data()["upvoteCount"], 0);
    assert_eq!(second.data()["downvoteCount"], 0);

    let third = vote(&t, Some(&alice), comment_id, json!(false)).await;
    assert_eq!(third.data()["upvoteCount"], 0);
    assert_eq!(third.data()["downvoteCount"], 1);

    let rows: i64 = t
        .state
        .db
        .get()
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM comment_votes WHERE comment_id = ?1",
            [comment_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1);

    let tally = t.get(&format!("/api/comments/{comment_id}/votes"), Some(&alice)).await;
    assert_eq!(tally.data()["isUpVote"], false);
    assert_eq!(tally.data()["downvoteCount"], 1);
}

#[tokio::test]
async fn vote_requires_identity_and_an_existing_comment() {
    let t = TestApp::new().await;
    let alice = t.sign_up("alice", "alice@example.com").await;
    let post_id = t.create_post(&alice, "Votes", &[]).await;
    let comment_id = t.create_comment(None, post_id, "anonymous words").await;

    let reply = vote(&t, None, comment_id, json!(true)).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = vote(&t, Some(&alice), 999, json!(true)).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = vote(&t, None, 999, json!(true)).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = vote(&t, Some("garbage"), comment_id, json!(true)).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn vote_refreshes_cached_post_and_comment() {
    let t = TestApp::new().await;
    let alice = t.sign_up("alice", "alice@example.com").await;
    let bob = t.sign_up("bob", "bob@example.com").await;
    let post_id = t.create_post(&alice, "Cached", &[]).await;
    let comment_id = t.create_comment(Some(&bob), post_id, "hello").await;

    let detail = t.get(&format!("/api/posts/{post_id}"), None).await;
    assert_eq!(detail.data()["comments"][0]["upVoteCount"], 0);
    t.get(&format!("/api/comments/{comment_id}"), None).await;

    vote(&t, Some(&alice), comment_id, json!(true)).await;
    vote(&t, Some(&bob), comment_id, json!(true)).await;

    let cached: Option<PostDetail> = t.state.cache.get(&keys::post(post_id)).await;
    assert!(cached.is_none());
    let cached: Option<Comment> = t.state.cache.get(&keys::comment(comment_id)).await;
    assert!(cached.is_none());

    let detail = t.get(&format!("/api/posts/{post_id}"), None).await;
    assert_eq!(detail.data()["comments"][0]["upVoteCount"], 2);
    let comment = t.get(&format!("/api/comments/{comment_id}"), None).await;
    assert_eq!(comment.data()["upVoteCount"], 2);
}

async fn edit(t: &TestApp, token: &str, comment_id: i64) -> StatusCode {
    t.request(
        Method::PUT,
        &format!("/api/comments/{comment_id}"),
        Some(token),
        Some(json!({ "content": "edited" })),
    )
    .await
    .status
}

#[tokio::test]
async fn comment_authors_and_permissions() {
    let t = TestApp::new().await;
    let owner = t.sign_up("owner", "owner@example.com").await;
    let writer = t.sign_up("writer", "writer@example.com").await;
    let stranger = t.sign_up("stranger", "stranger@example.com").await;
    let post_id = t.create_post(&owner, "Discuss", &[]).await;

    let by_writer = t.create_comment(Some(&writer), post_id, "mine").await;
    let anonymous = t.create_comment(None, post_id, "who am i").await;

    let list = t.get(&format!("/api/posts/{post_id}/comments?orderBy=author"), None).await;
    let authors: Vec<&str> = list
        .data()
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["author"].as_str().unwrap())
        .collect();
    assert_eq!(authors, ["Anonymous", "writer"]);

    assert_eq!(edit(&t, &stranger, by_writer).await, StatusCode::FORBIDDEN);
    assert_eq!(edit(&t, &writer, by_writer).await, StatusCode::OK);
    assert_eq!(edit(&t, &owner, anonymous).await, StatusCode::OK);

    let reply = t
        .request(Method::DELETE, &format!("/api/comments/{anonymous}"), Some(&stranger), None)
        .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    let reply = t
        .request(Method::DELETE, &format!("/api/comments/{anonymous}"), Some(&owner), None)
        .await;
    assert_eq!(reply.status, StatusCode::OK);

    let list = t.get(&format!("/api/posts/{post_id}/comments"), None).await;
    assert_eq!(list.pagination()["totalCount"], 1);
}

#[tokio::test]
async fn comments_on_missing_post_are_404() {
    let t = TestApp::new().await;
    let reply = t
        .post("/api/posts/5/comments", None, json!({ "content": "hello?" }))
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}
