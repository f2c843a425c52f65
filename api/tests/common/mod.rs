//! Shared harness: the real router over an in-memory database, the in-memory
//! cache, a temp-dir image store and a mailer that records what it sends.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use blog_api::{
    cache::Cache,
    config::AppConfig,
    db,
    images::LocalImageStore,
    jobs::JobQueue,
    mailer::{Email, Mailer},
    router, AppState,
};
use serde_json::Value;
use tower::ServiceExt;

pub const ADMIN_EMAIL: &str = "admin@example.com";
pub const PASSWORD: &str = "correct-horse";

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Email>>,
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub mailer: Arc<RecordingMailer>,
    pub upload_dir: PathBuf,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    pub fn pagination(&self) -> Value {
        let raw = self.headers["x-pagination"].to_str().unwrap();
        serde_json::from_str(raw).unwrap()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.upload_dir);
    }
}

impl TestApp {
    pub async fn new() -> Self {
        let upload_dir =
            std::env::temp_dir().join(format!("blog-api-test-{}", uuid::Uuid::new_v4()));

        let mut config = AppConfig::defaults().unwrap();
        config.admin_email = Some(ADMIN_EMAIL.into());
        config.public_url = "http://blog.test".into();
        config.upload_dir = upload_dir.display().to_string();
        let config = Arc::new(config);

        let images = Arc::new(
            LocalImageStore::create(upload_dir.clone(), "http://blog.test/uploads".into())
                .await
                .unwrap(),
        );
        let mailer = Arc::new(RecordingMailer::default());
        let jobs = JobQueue::start(mailer.clone(), images.clone());

        let state = AppState {
            db: db::open_in_memory().unwrap(),
            config,
            cache: Cache::memory(),
            images,
            jobs,
        };

        Self {
            app: router(state.clone()),
            state,
            mailer,
            upload_dir,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Reply {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> Reply {
        self.request(Method::GET, uri, token, None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> Reply {
        self.request(Method::POST, uri, token, Some(body)).await
    }

    /// Registers an account and returns its access token.
    pub async fn sign_up(&self, user_name: &str, email: &str) -> String {
        let reply = self
            .post(
                "/api/auth/register",
                None,
                serde_json::json!({
                    "userName": user_name,
                    "email": email,
                    "password": PASSWORD,
                }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
        self.login(user_name).await
    }

    pub async fn login(&self, user_name: &str) -> String {
        let reply = self
            .post(
                "/api/auth/login",
                None,
                serde_json::json!({ "userName": user_name, "password": PASSWORD }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        reply.data()["accessToken"].as_str().unwrap().to_string()
    }

    pub async fn admin(&self) -> String {
        self.sign_up("admin", ADMIN_EMAIL).await
    }

    pub async fn create_post(&self, token: &str, title: &str, tag_ids: &[i64]) -> i64 {
        let reply = self
            .post(
                "/api/posts",
                Some(token),
                serde_json::json!({ "title": title, "content": format!("{title} body"), "tagIds": tag_ids }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
        reply.data()["id"].as_i64().unwrap()
    }

    pub async fn create_comment(&self, token: Option<&str>, post_id: i64, content: &str) -> i64 {
        let reply = self
            .post(
                &format!("/api/posts/{post_id}/comments"),
                token,
                serde_json::json!({ "content": content }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
        reply.data()["id"].as_i64().unwrap()
    }

    /// Waits until the job worker has delivered at least `n` emails.
    pub async fn wait_for_mail(&self, n: usize) -> Vec<Email> {
        for _ in 0..200 {
            {
                let sent = self.mailer.sent.lock().unwrap();
                if sent.len() >= n {
                    return sent.clone();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {n} emails");
    }
}
