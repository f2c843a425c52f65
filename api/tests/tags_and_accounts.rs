mod common;

use axum::http::{Method, StatusCode};
use blog_api::cache::keys;
use blog_shared::{PostDetail, Tag};
use common::{TestApp, ADMIN_EMAIL, PASSWORD};
use serde_json::json;

#[tokio::test]
async fn duplicate_tag_names_conflict_ignoring_case() {
    let t = TestApp::new().await;
    let admin = t.admin().await;

    let tech = t.post("/api/tags", Some(&admin), json!({ "name": "tech" })).await;
    assert_eq!(tech.status, StatusCode::CREATED);
    let tech_id = tech.data()["id"].as_i64().unwrap();

    let dup = t.post("/api/tags", Some(&admin), json!({ "name": "Tech" })).await;
    assert_eq!(dup.status, StatusCode::CONFLICT);
    assert_eq!(dup.body["message"], "Tag already exists");

    let life = t.post("/api/tags", Some(&admin), json!({ "name": "life" })).await;
    let life_id = life.data()["id"].as_i64().unwrap();
    let rename = t
        .request(
            Method::PUT,
            &format!("/api/tags/{life_id}"),
            Some(&admin),
            Some(json!({ "name": "TECH" })),
        )
        .await;
    assert_eq!(rename.status, StatusCode::CONFLICT);

    let same = t
        .request(
            Method::PUT,
            &format!("/api/tags/{tech_id}"),
            Some(&admin),
            Some(json!({ "name": "Tech" })),
        )
        .await;
    assert_eq!(same.status, StatusCode::OK);
}

#[tokio::test]
async fn tag_writes_are_admin_only() {
    let t = TestApp::new().await;
    let user = t.sign_up("plain", "plain@example.com").await;

    let reply = t.post("/api/tags", Some(&user), json!({ "name": "nope" })).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    let reply = t.post("/api/tags", None, json!({ "name": "nope" })).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    let reply = t.get("/api/tags/1", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tag_changes_invalidate_lists_and_linked_posts() {
    let t = TestApp::new().await;
    let admin = t.admin().await;
    let tag = t.post("/api/tags", Some(&admin), json!({ "name": "rust" })).await;
    let tag_id = tag.data()["id"].as_i64().unwrap();
    let post_id = t.create_post(&admin, "Tagged", &[tag_id]).await;

    assert_eq!(t.get("/api/tags", None).await.data()[0]["name"], "rust");
    t.get(&format!("/api/tags/{tag_id}"), None).await;
    t.get(&format!("/api/posts/{post_id}"), None).await;

    let cached: Option<Vec<Tag>> = t.state.cache.get(keys::TAGS).await;
    assert_eq!(cached.unwrap().len(), 1);

    t.request(
        Method::PUT,
        &format!("/api/tags/{tag_id}"),
        Some(&admin),
        Some(json!({ "name": "Rust" })),
    )
    .await;

    assert!(t.state.cache.get::<Vec<Tag>>(keys::TAGS).await.is_none());
    assert!(t.state.cache.get::<Tag>(&keys::tag(tag_id)).await.is_none());
    assert!(t.state.cache.get::<PostDetail>(&keys::post(post_id)).await.is_none());

    let detail = t.get(&format!("/api/posts/{post_id}"), None).await;
    assert_eq!(detail.data()["tags"], json!(["Rust"]));

    let reply = t
        .request(Method::DELETE, &format!("/api/tags/{tag_id}"), Some(&admin), None)
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    let detail = t.get(&format!("/api/posts/{post_id}"), None).await;
    assert_eq!(detail.data()["tags"], json!([]));
    assert_eq!(t.get("/api/tags", None).await.data(), &json!([]));
}

#[tokio::test]
async fn registration_confirmation_and_login() {
    let t = TestApp::new().await;
    let reply = t
        .post(
            "/api/auth/register",
            None,
            json!({ "userName": "newbie", "email": "newbie@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.data()["emailConfirmed"], false);
    assert_eq!(reply.data()["roles"], json!(["User"]));

    let again = t
        .post(
            "/api/auth/register",
            None,
            json!({ "userName": "other", "email": "NEWBIE@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    let mail = t.wait_for_mail(1).await;
    let link = mail[0]
        .html
        .split("href='")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .unwrap()
        .to_string();
    let path = link.strip_prefix("http://blog.test").unwrap();

    let wrong = t
        .get("/api/auth/confirm-email?token=nope&email=newbie%40example.com", None)
        .await;
    assert_eq!(wrong.status, StatusCode::BAD_REQUEST);

    let confirmed = t.get(path, None).await;
    assert_eq!(confirmed.status, StatusCode::OK, "{}", confirmed.body);
    assert_eq!(confirmed.data()["emailConfirmed"], true);

    let bad = t
        .post(
            "/api/auth/login",
            None,
            json!({ "userName": "newbie", "password": "wrong-password" }),
        )
        .await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);

    let token = t.login("newbie").await;
    let me = t.get("/api/auth/me", Some(&token)).await;
    assert_eq!(me.data()["userName"], "newbie");
}

#[tokio::test]
async fn refresh_rotates_tokens() {
    let t = TestApp::new().await;
    t.sign_up("ann", "ann@example.com").await;
    let login = t
        .post("/api/auth/login", None, json!({ "userName": "ann", "password": PASSWORD }))
        .await;
    let pair = login.data().clone();

    let refreshed = t.post("/api/auth/refresh-token", None, pair.clone()).await;
    assert_eq!(refreshed.status, StatusCode::OK);
    assert_ne!(refreshed.data()["refreshToken"], pair["refreshToken"]);

    let replay = t.post("/api/auth/refresh-token", None, pair).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);

    let forged = t
        .post(
            "/api/auth/refresh-token",
            None,
            json!({ "accessToken": "not.a.jwt", "refreshToken": "x" }),
        )
        .await;
    assert_eq!(forged.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_manages_roles() {
    let t = TestApp::new().await;
    let admin = t.admin().await;
    let user = t.sign_up("editor", "editor@example.com").await;

    let me = t.get("/api/auth/me", Some(&admin)).await;
    assert_eq!(me.data()["email"], ADMIN_EMAIL);
    assert_eq!(me.data()["roles"], json!(["Administrator", "User"]));

    let denied = t.get("/api/auth/users", Some(&user)).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let added = t
        .post(
            "/api/auth/roles/add",
            Some(&admin),
            json!({ "email": "editor@example.com", "roles": ["Administrator"] }),
        )
        .await;
    assert_eq!(added.status, StatusCode::OK);
    assert_eq!(added.data()["roles"], json!(["Administrator", "User"]));

    let unknown = t
        .post(
            "/api/auth/roles/add",
            Some(&admin),
            json!({ "email": "editor@example.com", "roles": ["Root"] }),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

    let removed = t
        .post(
            "/api/auth/roles/remove",
            Some(&admin),
            json!({ "email": "editor@example.com", "roles": ["Administrator"] }),
        )
        .await;
    assert_eq!(removed.data()["roles"], json!(["User"]));

    let users = t.get("/api/auth/users", Some(&admin)).await;
    assert_eq!(users.data().as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn health() {
    let t = TestApp::new().await;
    let reply = t.get("/api/health", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!("ok"));
}

#[tokio::test]
async fn malformed_requests_use_the_error_envelope() {
    let t = TestApp::new().await;
    let admin = t.admin().await;

    let missing = t.post("/api/tags", Some(&admin), json!({})).await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.body["isSuccess"], false);
    assert_eq!(missing.body["statusCode"], 400);
    assert_eq!(missing.body["errors"][0]["field"], "name");

    let not_a_number = t.get("/api/posts/abc", None).await;
    assert_eq!(not_a_number.status, StatusCode::BAD_REQUEST);
    assert_eq!(not_a_number.body["isSuccess"], false);
    assert_eq!(not_a_number.body["errors"][0]["field"], "id");

    let wrong_type = t
        .post("/api/auth/login", None, json!({ "userName": 7, "password": PASSWORD }))
        .await;
    assert_eq!(wrong_type.status, StatusCode::BAD_REQUEST);
    assert_eq!(wrong_type.body["errors"][0]["field"], "body");

    let no_token = t.get("/api/auth/confirm-email?email=x%40example.com", None).await;
    assert_eq!(no_token.status, StatusCode::BAD_REQUEST);
    assert_eq!(no_token.body["errors"][0]["field"], "token");
}
