use actix_cors::Cors;
use actix_web::middleware::{Compress, DefaultHeaders};
use actix_web::{App, HttpServer};
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod cache;
mod error;
mod markdown;
mod models;
mod openapi;
mod perm;
mod rate_limit;
mod render;
mod repo;
mod routes;
mod view;

use cache::{ThreadCache, THREAD_CACHE_CAPACITY};
use openapi::ApiDoc;
use rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use render::ResourceUrlConfig;
#[cfg(feature = "inmem-store")]
use repo::inmem::InMemRepo;
use routes::{config, AppState};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables must be set externally (shell, systemd, Docker, etc.)
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping mbbs server");
    info!(
        "Resource base URL: {}",
        std::env::var("MBBS_RESOURCE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/resources/".to_string())
    );

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = InMemRepo::new();
    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    info!("Using in-memory repository backend");

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        info!("Using Postgres repository backend");
        repo::pg::PgRepo::new(pool)
    };

    let openapi = ApiDoc::openapi();
    let thread_cache = Arc::new(ThreadCache::new(THREAD_CACHE_CAPACITY));
    let rate_limiter = RateLimiterFacade::new(
        InMemoryRateLimiter::new(
            std::env::var("RL_ENABLED").map(|v| v != "0").unwrap_or(true),
        ),
        RateLimitConfig::from_env(),
    );
    let resource = ResourceUrlConfig::from_env();

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // local dev frontends
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY"))
                    .add(("Referrer-Policy", "strict-origin-when-cross-origin")),
            )
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi.clone()))
            .app_data(actix_web::web::Data::new(AppState {
                repo: Arc::new(repo.clone()),
                thread_cache: thread_cache.clone(),
                rate_limiter: rate_limiter.clone(),
                resource: resource.clone(),
            }))
    })
    .bind(("0.0.0.0", 8080))?;

    info!("Listening on http://0.0.0.0:8080 (all interfaces)");

    server.run().await
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let required = vec!["JWT_SECRET"];

    let mut missing = Vec::new();
    for var in required {
        if env::var(var).is_err() {
            missing.push(var);
        }
    }

    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {:?}", missing);
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }
}
