use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use inventory_service::api::{self, AppState};
use inventory_service::config::Args;
use inventory_service::kafka::{self, KafkaEventSink, ProductConsumer};
use inventory_service::postgres::PgRepository;
use inventory_service::{InventoryService, MeteredRepository, Metrics};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run_migrations(database_url: &str) -> Result<()> {
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if args.skip_migrations {
        info!("Skipping database migrations");
    } else {
        let database_url = args.database_url.clone();
        tokio::task::spawn_blocking(move || run_migrations(&database_url)).await??;
    }

    let metrics = Metrics::new()?;
    let repo = PgRepository::connect(&args.database_url, args.db_pool_size).await?;
    let repo = MeteredRepository::new(repo, metrics.clone());

    let producer = KafkaEventSink::producer(&args.kafka_brokers, args.publish_timeout())?;
    let events = KafkaEventSink::new(
        producer.clone(),
        args.inventory_topic.clone(),
        args.reservation_topic.clone(),
        args.publish_timeout(),
    );

    let service = Arc::new(InventoryService::with_config(repo, events, args.service_config()));

    let consumer = kafka::product_consumer(&args.kafka_brokers, &args.consumer_group, &args.product_topic)?;
    let products = ProductConsumer::new(
        service.clone(),
        producer,
        args.product_dlt_topic.clone(),
        args.publish_timeout(),
    );
    tokio::spawn(async move {
        products.run(consumer).await;
    });

    let app = api::create_router(AppState::new(service, args.subscriber_queue(), metrics));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Inventory service web server started on port {}", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
