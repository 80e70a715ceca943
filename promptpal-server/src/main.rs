use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use promptpal_core::models::NewUser;
use promptpal_core::store::UserStore;
use promptpal_core::{
    Clock, MemoryStore, OpenAiClient, PgStore, PromptPalConfig, Store, StoreError, SystemClock,
};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use promptpal_server::http::{start_http_server, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "promptpal.toml")]
    config: String,

    /// Check the database connection and exit.
    #[arg(long)]
    health: bool,

    /// Keep everything in process memory instead of Postgres.
    #[arg(long)]
    in_memory: bool,

    /// Make sure an admin user with this wallet address exists.
    #[arg(long, value_name = "ADDRESS")]
    seed_admin: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match PromptPalConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging: RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (store, pool): (Arc<dyn Store>, Option<sqlx::PgPool>) = if args.in_memory {
        tracing::warn!("Running on the in-memory store; nothing will be persisted");
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(clock.clone()));
        (store, None)
    } else if args.health {
        let pool = match promptpal_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        };
        match promptpal_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ PromptPal DB health check passed");
        return Ok(());
    } else {
        let pool = promptpal_core::db::connect(&config.database).await?;
        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone(), clock.clone()));
        (store, Some(pool))
    };

    if let Some(addr) = args.seed_admin {
        seed_admin(store.as_ref(), addr).await?;
    }

    let provider = Arc::new(OpenAiClient::new(Duration::from_secs(
        config.provider.timeout_seconds,
    ))?);

    if !config.http.enabled {
        tracing::warn!("HTTP API disabled in config; nothing to serve");
        return Ok(());
    }

    let state = Arc::new(AppState::new(config, store, pool, provider, clock)?);

    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = tx.send(());
    });

    start_http_server(state, rx).await
}

async fn seed_admin(store: &dyn Store, addr: String) -> anyhow::Result<()> {
    let user = NewUser {
        name: "admin".to_string(),
        addr,
        email: String::new(),
        level: 1,
    };
    match store.create_user(user).await {
        Ok(u) => tracing::info!(user_id = u.id, addr = %u.addr, "Admin user created"),
        Err(StoreError::Conflict(_)) => tracing::info!("Admin user already exists"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
