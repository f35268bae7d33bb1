use clap::{Parser, Subcommand};
use resilient_kafka::outbox::PostgresOutbox;
use resilient_kafka::topology::Topology;
use resilient_kafka::{Config, MessageBroker, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "resilient-kafka")]
#[command(about = "Kafka retry/dead-letter topology and outbox relay", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure the main, retry and dead-letter topics of a message type exist
    Declare {
        #[arg(long, help = "Message type name, e.g. OrderCreatedEvent")]
        type_name: String,

        #[arg(long, default_value_t = 3)]
        retries: u32,

        #[arg(long, default_value_t = 1)]
        partitions: i32,
    },
    /// Create the outbox table
    Migrate,
    /// Publish outbox records until interrupted
    Relay,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting resilient-kafka");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        kafka_brokers = ?config.kafka.bootstrap_servers,
        kafka_topic_prefix = %config.kafka.topic_prefix,
        consumer_group = %config.kafka.consumer_group,
        outbox_table = %config.outbox.table,
        "Configuration summary"
    );

    match args.command {
        Command::Declare {
            type_name,
            retries,
            partitions,
        } => declare(config, &type_name, retries, partitions).await,
        Command::Migrate => migrate(&config).await,
        Command::Relay => relay(config).await,
    }
}

async fn declare(config: Config, type_name: &str, retries: u32, partitions: i32) -> Result<()> {
    let topology = Topology::new(&config.kafka.topic_prefix, type_name, retries)?;
    let broker = MessageBroker::connect(config)?;

    broker
        .admin()
        .ensure_topics(&topology.names(), partitions)
        .await?;

    for name in topology.names() {
        info!("Topic ready: {}", name);
    }
    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let outbox = PostgresOutbox::connect(&config.outbox).await?;
    outbox.ensure_schema().await?;
    outbox.close().await;
    Ok(())
}

async fn relay(config: Config) -> Result<()> {
    let store = Arc::new(PostgresOutbox::connect(&config.outbox).await?);
    let broker = MessageBroker::connect(config)?;
    let dispatcher = broker.outbox_dispatcher(store);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    dispatcher.run(cancel).await
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("resilient_kafka=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("resilient_kafka=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
