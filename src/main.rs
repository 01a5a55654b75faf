use actix_web::{middleware::Compress, web, App, HttpServer};
use actix_cors::Cors;
use utoipa_swagger_ui::SwaggerUi;

mod error;
mod geocode;
mod models;
mod openapi;
mod repo;
mod routes;
mod security;
mod storage;

use geocode::{AmapGeocoder, Geocoder};
use openapi::ApiDoc;
use repo::{ensure_default_user, Repo};
use routes::{config, AppState};
use security::SecurityHeaders;
use storage::{FsMediaStore, MediaStore};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env automatically only in debug builds; production gets its
    // environment from the service manager.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping Orbit server");

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo: Arc<dyn Repo> = {
        info!("Using in-memory repository backend");
        Arc::new(repo::inmem::InMemRepo::new())
    };

    #[cfg(feature = "postgres-store")]
    let repo: Arc<dyn Repo> = {
        use sqlx::postgres::PgPoolOptions;
        let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .expect("Failed to create Pg pool");
        sqlx::migrate!()
            .run(&pool)
            .await
            .expect("Failed to run database migrations");
        info!("Using Postgres repository backend");
        Arc::new(repo::pg::PgRepo::new(pool))
    };

    if let Err(e) = ensure_default_user(repo.as_ref()).await {
        eprintln!("Failed to start server: {e}");
        std::process::exit(1);
    }

    let media_store: Arc<dyn MediaStore> = Arc::new(FsMediaStore::from_env());
    let geocoder: Arc<dyn Geocoder> = Arc::new(AmapGeocoder::from_env());
    info!(
        "AMap geocoding configured: {}",
        std::env::var("AMAP_WEB_SERVICE_KEY").is_ok()
    );

    let openapi = ApiDoc::openapi();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(51001);

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // local Vite dev server
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "DELETE", "OPTIONS"])
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
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
            .app_data(web::Data::new(AppState {
                repo: repo.clone(),
                media_store: media_store.clone(),
                geocoder: geocoder.clone(),
            }))
    })
    .bind(("0.0.0.0", port))?;

    info!("Listening on http://0.0.0.0:{port}");
    server.run().await
}
