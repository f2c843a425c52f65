use std::sync::Arc;

use anyhow::Context;
use axum::http::{header::HeaderName, HeaderValue};
use blog_api::{
    cache::Cache,
    config::{AppConfig, ImageBackend},
    db, images,
    jobs::JobQueue,
    mailer::LogMailer,
    paging::PAGINATION_HEADER,
    router, AppState,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(AppConfig::load().context("loading configuration")?);

    let pool = db::open(&config.database_url).context("opening database")?;
    let cache = Cache::from_url(config.redis_url.as_deref()).await;
    let image_store = images::from_config(&config).await?;
    let jobs = JobQueue::start(Arc::new(LogMailer), Arc::clone(&image_store));

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .cors_origin
                .parse::<HeaderValue>()
                .context("invalid cors_origin")?,
        )
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any())
        .expose_headers([HeaderName::from_static(PAGINATION_HEADER)]);

    let state = AppState {
        db: pool,
        config: Arc::clone(&config),
        cache,
        images: image_store,
        jobs,
    };

    let mut app = router(state);
    if config.image_store == ImageBackend::Local {
        app = app.nest_service("/uploads", ServeDir::new(&config.upload_dir));
    }
    let app = app.layer(TraceLayer::new_for_http()).layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("binding {}", config.server_addr))?;
    tracing::info!(addr = %config.server_addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
