//! technews-cache - cache maintenance for the tech news aggregator.
//!
//! Runs the cache warmer and Redis memory optimizer as a long-lived process,
//! or performs one maintenance action and exits.

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::Arc;

use technews_core::{
    cache::{CacheDomain, DomainCacheBuilder, DomainCaches, KeyNamespace, StampedeConfig, DELETE_BATCH_SIZE},
    config::Settings,
    db::PgRepositories,
    jobs::{BackgroundTasks, CacheWarmer, MemoryOptimizer, WarmCategory},
    resilience::{DistributedLock, LockConfig},
    store::{delete_matching, scan_keys, KeyValueStore, RedisStore},
    telemetry::{init_telemetry, redact_url},
};

#[derive(Parser)]
#[command(
    name = "technews-cache",
    version,
    about = "Cache warming, memory optimization and invalidation for the tech news cache",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "TECHNEWS_CONFIG")]
    config: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Warm on startup, then run the warmer and memory optimizer until stopped
    Run,

    /// Warm caches once
    Warm {
        /// Only this category (stats, trends, keywords, search)
        #[arg(short, long, value_parser = parse_category)]
        category: Option<WarmCategory>,
    },

    /// Check Redis memory and optimize if needed
    Memory,

    /// Delete cached entries of one domain
    Invalidate {
        /// Domain key segment (stats, trends, search, tags, filters, article-detail, ...)
        #[arg(value_parser = parse_domain)]
        domain: CacheDomain,

        /// Glob relative to the domain, e.g. `results:*`
        #[arg(short, long)]
        pattern: Option<String>,
    },

    /// Show key counts per domain and Redis memory usage
    Stats,

    /// Print the effective configuration
    Config,
}

fn parse_category(value: &str) -> Result<WarmCategory, String> {
    value.parse().map_err(|e: technews_core::CoreError| e.to_string())
}

fn parse_domain(value: &str) -> Result<CacheDomain, String> {
    CacheDomain::from_prefix(value).ok_or_else(|| format!("unknown cache domain: {value}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::load()?,
    };

    if let Commands::Config = cli.command {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    let _metrics = init_telemetry(&settings)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        redis = %redact_url(&settings.redis.url),
        "Starting technews-cache"
    );

    let store: Arc<dyn KeyValueStore> =
        Arc::new(RedisStore::connect(&settings.redis.url, settings.redis.command_timeout).await?);
    let namespace = KeyNamespace::new(&settings.redis.key_prefix, &settings.redis.environment);
    let tasks = BackgroundTasks::new();
    let lock = DistributedLock::new(Arc::clone(&store), namespace.clone(), LockConfig::from(&settings.lock));

    let caches = DomainCacheBuilder {
        store: Arc::clone(&store),
        namespace: namespace.clone(),
        ttl: settings.ttl.clone(),
        lock: Some(lock.clone()),
        stampede: StampedeConfig::from(&settings.stampede),
        tasks: tasks.clone(),
    }
    .build();

    match cli.command {
        Commands::Run => {
            let warmer = warmer(&settings, caches.clone(), lock).await?;
            let warmer_handle = settings.warmer.enabled.then(|| warmer.start());
            let memory_handle = settings
                .memory_optimizer
                .enabled
                .then(|| memory_optimizer(&settings, &store, &namespace, &caches).start());

            shutdown_signal().await;

            for handle in [warmer_handle, memory_handle].into_iter().flatten() {
                handle.stop().await;
            }
        }
        Commands::Warm { category } => {
            let warmer = warmer(&settings, caches, lock).await?;
            let outcomes = match category {
                Some(category) => vec![warmer.warm_category(category).await],
                None => warmer.warm_all().await,
            };
            match cli.format {
                OutputFormat::Json => print_json(&outcomes)?,
                OutputFormat::Text => {
                    for o in &outcomes {
                        let status = if o.success { "ok" } else { "failed" };
                        println!("{:<10} {:<7} {:>5} items {:>6} ms", o.category.as_str(), status, o.items, o.duration_ms);
                        if let Some(error) = &o.error {
                            println!("           {error}");
                        }
                    }
                }
            }
        }
        Commands::Memory => {
            let report = memory_optimizer(&settings, &store, &namespace, &caches).check().await?;
            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    let usage = report
                        .usage_percent
                        .map_or_else(|| "unknown".to_string(), |p| format!("{p:.1}%"));
                    println!("used:   {} bytes", report.used);
                    println!("usage:  {usage}");
                    println!("level:  {}", report.level.as_str());
                    println!("action: {:?}", report.action);
                }
            }
        }
        Commands::Invalidate { domain, pattern } => {
            let pattern = format!("{}:{}", namespace.domain(domain), pattern.as_deref().unwrap_or("*"));
            let removed = delete_matching(store.as_ref(), &pattern, DELETE_BATCH_SIZE).await?;
            tracing::info!(%domain, pattern, removed, "Invalidated");
            match cli.format {
                OutputFormat::Json => print_json(&serde_json::json!({ "pattern": pattern, "removed": removed }))?,
                OutputFormat::Text => println!("removed {removed} keys matching {pattern}"),
            }
        }
        Commands::Stats => {
            let stats = key_stats(store.as_ref(), &namespace).await?;
            match cli.format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Text => {
                    for (domain, keys) in &stats.domains {
                        println!("{:<15} {keys:>8} keys", domain.prefix());
                    }
                    match stats.usage_percent {
                        Some(p) => println!("redis memory: {} bytes ({p:.1}%)", stats.used_memory),
                        None => println!("redis memory: {} bytes", stats.used_memory),
                    }
                }
            }
        }
        Commands::Config => {}
    }

    tasks.flush().await;
    tracing::info!("technews-cache finished");
    Ok(())
}

async fn warmer(settings: &Settings, caches: DomainCaches, lock: DistributedLock) -> anyhow::Result<CacheWarmer> {
    let repo = Arc::new(PgRepositories::connect(&settings.database).await?);
    tracing::info!(database = %redact_url(&settings.database.url), "Connected to database");
    Ok(CacheWarmer::new(caches, repo, lock, settings.warmer.clone()))
}

fn memory_optimizer(
    settings: &Settings,
    store: &Arc<dyn KeyValueStore>,
    namespace: &KeyNamespace,
    caches: &DomainCaches,
) -> MemoryOptimizer {
    MemoryOptimizer::new(Arc::clone(store), namespace.clone(), settings.memory_optimizer.clone())
        .with_caches(caches.clone())
}

#[derive(Serialize)]
struct KeyStats {
    domains: Vec<(CacheDomain, usize)>,
    used_memory: u64,
    usage_percent: Option<f64>,
}

async fn key_stats(store: &dyn KeyValueStore, namespace: &KeyNamespace) -> anyhow::Result<KeyStats> {
    let mut domains = Vec::with_capacity(CacheDomain::ALL.len());
    for domain in CacheDomain::ALL {
        let keys = scan_keys(store, &namespace.domain_pattern(domain), 500, None).await?;
        domains.push((domain, keys.len()));
    }
    let info = store.memory_info().await?;
    Ok(KeyStats {
        domains,
        used_memory: info.used_memory,
        usage_percent: info.usage_percent(),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
