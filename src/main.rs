use mindflow::{
    api,
    auth::AppState,
    extraction::{DisabledExtractor, Extractor, GeminiExtractor},
    persist::SaveFile,
    settings::Settings,
    staging::Pipeline,
    store::Store,
    sweep,
};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        error!("server failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "profile-console")]
fn init_tracing() {
    console_subscriber::init();
}

#[cfg(not(feature = "profile-console"))]
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mindflow=info,mindflow_server=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;

    // ── Boot the World ─────────────────────────────────────────
    let save_file = SaveFile::open(&settings.save_file)?;
    let world = save_file.load_world()?;
    info!(
        tasks = world.tasks.len(),
        lists = world.lists.len(),
        recipes = world.recipes.len(),
        staging = world.staging.len(),
        users = world.users.len(),
        revision = world.revision,
        "world loaded"
    );
    let store = Store::new(world, save_file);

    // ── Extraction ─────────────────────────────────────────────
    let extractor: Arc<dyn Extractor> = match settings.extraction.api_key.clone() {
        Some(key) => Arc::new(GeminiExtractor::new(&settings.extraction, key)?),
        None => {
            warn!("no extraction API key configured, voice capture disabled");
            Arc::new(DisabledExtractor)
        }
    };
    let pipeline = Pipeline::new(store.clone(), extractor);

    // ── Wake-up sweep ──────────────────────────────────────────
    sweep::spawn(store.clone(), Duration::from_secs(settings.sweep_interval_secs.max(1)));

    // ── Router ─────────────────────────────────────────────────
    let static_dir = settings.static_dir.clone();
    let addr: SocketAddr = format!("{}:{}", settings.bind_address, settings.port).parse()?;
    let state = Arc::new(AppState { store, pipeline, settings });

    let app = api::router(state)
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // ── Start ──────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server running on http://{addr}");
    info!("  live feed: ws://{addr}/api/live");
    axum::serve(listener, app).await?;
    Ok(())
}
