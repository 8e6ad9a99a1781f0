//! NNTP fetcher binary.
//!
//! Plans and downloads article ranges from the configured providers
//! into the local sharded store. Prints a single error line and exits
//! nonzero on fatal errors; per-group failures are logged and the run
//! continues with the next group.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pugleaf::batch::BatchOrchestrator;
use pugleaf::config::{
    AppConfig, FetchArgs, DEFAULT_LOG_FILTER, FETCHER_DB_IDLE_TIMEOUT,
};
use pugleaf::fetch::dates::{parse_start_date, ChronoDateParser};
use pugleaf::fetch::{FetchOptions, Processor};
use pugleaf::nntp::NntpPool;
use pugleaf::storage::{Database, DatabaseOptions};
use pugleaf::Error;

#[tokio::main]
async fn main() {
    let args = FetchArgs::parse();

    if let Err(e) = run(args).await {
        eprintln!("pugleaf-fetch: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(args: FetchArgs) -> pugleaf::Result<()> {
    args.validate()?;

    let config = AppConfig::load_or_default(&args.config)?;
    init_tracing(&config);

    let providers = args.providers(&config);
    if providers.is_empty() {
        return Err(Error::Config(
            "no providers configured; pass --host or add [[provider]] sections".into(),
        ));
    }

    let download_start_date = match &args.download_start_date {
        Some(raw) => Some(parse_start_date(raw).ok_or_else(|| {
            Error::Validation(format!("--download-start-date must be YYYY-MM-DD, got {raw}"))
        })?),
        None => None,
    };

    // A bare connection test needs no storage at all.
    if args.test_conn {
        for provider in &providers {
            let pool = NntpPool::new(provider.clone(), config.nntp.clone());
            let conn = pool.get().await?;
            info!(provider = %provider.name, posting = conn.posting_ok(), "connection test ok");
            println!("{}: connection ok", provider.name);
        }
        return Ok(());
    }

    let group_arg = match (&args.group, &args.message_id) {
        (Some(group), _) => group.clone(),
        (None, Some(_)) => {
            return Err(Error::Validation(
                "--message-id requires --group to pick the target group".into(),
            ))
        }
        (None, None) => {
            return Err(Error::Validation(
                "nothing to do: pass --group or --message-id".into(),
            ))
        }
    };

    let db = Database::open(
        config.paths.clone(),
        DatabaseOptions {
            idle_timeout: FETCHER_DB_IDLE_TIMEOUT,
            short_hash_len: args.useshorthashlen,
        },
    )?;
    db.start_background_tasks();

    let orchestrator = BatchOrchestrator::new(db.clone(), &config.batch);
    orchestrator.spawn();

    let options = FetchOptions {
        max_batch: args.max_batch as u64,
        max_loops: args.max_loops,
        xover_copy: args.xover_copy,
        ignore_initial_tiny_groups: args.ignore_initial_tiny_groups,
        download_start_date,
        nntp_hostname: args.nntphostname.clone(),
        fetch_active_only: args.fetch_active_only,
    };

    let shutdown = db.subscribe_shutdown();
    let mut providers = providers;
    providers.sort_by_key(|p| p.priority);

    let mut fatal: Option<Error> = None;
    'providers: for provider in providers {
        db.main.upsert_provider(&provider)?;
        let pool = NntpPool::new(provider.clone(), config.nntp.clone());
        pool.spawn_cleanup(shutdown.clone());

        let processor = Processor::new(
            db.clone(),
            pool,
            orchestrator.sender(),
            options.clone(),
            Arc::new(ChronoDateParser),
        );

        if let Some(message_id) = &args.message_id {
            match processor.fetch_message_id(&group_arg, message_id).await {
                Ok(true) => info!(%message_id, "article stored"),
                Ok(false) => warn!(%message_id, "provider does not carry the article"),
                Err(e) => {
                    error!(provider = %provider.name, error = %e, "message-id fetch failed");
                    fatal = Some(e);
                }
            }
            continue;
        }

        let groups = match processor.expand_groups(&group_arg).await {
            Ok(groups) => groups,
            Err(e) => {
                error!(provider = %provider.name, error = %e, "group expansion failed");
                fatal = Some(e);
                continue;
            }
        };
        if groups.is_empty() {
            warn!(provider = %provider.name, pattern = %group_arg, "no groups matched");
            continue;
        }

        for group in groups {
            match processor.run_group(&group).await {
                Ok(summary) if summary.skipped => {}
                Ok(summary) => {
                    info!(
                        group = %summary.group,
                        enqueued = summary.enqueued,
                        committed = summary.committed,
                        "group done"
                    );
                }
                Err(Error::Shutdown) => break 'providers,
                Err(e) => {
                    // Long-running fetch: log and continue per group.
                    error!(%group, error = %e, "group fetch failed");
                }
            }
        }
    }

    orchestrator.wait_quiescent().await;
    db.shutdown().await?;

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
