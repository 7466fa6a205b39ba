//! vault-daemon: AI Context Vault notes and sync from the command line.
//!
//! Shares the reconciliation engine with the browser extension, backed by a
//! JSON file store, a blob directory and the GitHub Gist API.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vault_core::{CheckOutcome, ContextRecord, MergeMode, SyncEvent, SyncOutcome};
use vault_daemon::{Args, Command, Config, Services};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,vault_daemon=debug"
    } else {
        "info,vault_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_args(&args)?;
    let services = Services::open(&config).await?;

    match args.command {
        Command::Configure { gist, token } => {
            services.configure(&gist, &token).await?;
            println!("Sync configured for {gist}");
        }
        Command::Add { domain, chat, text } => {
            let record = services.notes.add_entry(&domain, &chat, &text).await?;
            print_record(&record);
            sync(&services, None, MergeMode::Reconcile).await?;
        }
        Command::Delete { domain, chat, id } => {
            let deleted = match services.notes.delete_entry(&domain, &chat, &id).await? {
                Some(id) => Some(id),
                None => services.notes.delete_bookmark(&domain, &chat, &id).await?,
            };
            match deleted {
                Some(id) => sync(&services, Some(&id), MergeMode::Reconcile).await?,
                None => println!("No note or bookmark with id {id}"),
            }
        }
        Command::List { domain, chat } => {
            print_record(&services.notes.context(&domain, &chat).await?);
            for bookmark in services.notes.bookmarks(&domain, &chat).await? {
                println!("  * {}  {}  ({})", bookmark.id, bookmark.label, bookmark.selector);
            }
        }
        Command::Sync { remote_only } => {
            let mode = if remote_only {
                MergeMode::AdoptRemote
            } else {
                MergeMode::Reconcile
            };
            sync(&services, None, mode).await?;
        }
        Command::ClearLogs => {
            services.log_sync.clear_logs().await?;
            println!("Local activity log cleared");
        }
        Command::Run { domain, chat } => run(services, domain, chat).await?,
    }

    Ok(())
}

fn print_record(record: &ContextRecord) {
    if !record.summary.is_empty() {
        println!("{}", record.summary);
    }
    for entry in &record.entries {
        let mark = if entry.active { "x" } else { " " };
        println!("  [{mark}] {}  {}", entry.id, entry.text);
    }
}

async fn sync(services: &Services, delete_key: Option<&str>, mode: MergeMode) -> Result<()> {
    match services.coordinator.sync(delete_key, mode).await? {
        SyncOutcome::Completed(snapshot) => println!("Synced {} record(s)", snapshot.len()),
        SyncOutcome::Cancelled(reason) => println!("Sync cancelled: {reason:?}"),
        SyncOutcome::Skipped(reason) => println!("Sync skipped: {reason:?}"),
    }
    Ok(())
}

async fn run(services: Services, domain: Option<String>, chat: Option<String>) -> Result<()> {
    if let (Some(domain), Some(chat)) = (domain, chat) {
        services.detector.set_view(domain, chat);
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = services.events.subscribe(move |event| {
        let _ = tx.send(event);
    });

    if !services.detector.start().await {
        warn!("Sync is not configured; run `vault-daemon configure` first");
        return Ok(());
    }
    if services.detector.check_now().await == CheckOutcome::Refreshed {
        info!("Adopted remote changes on startup");
    }
    services.log_sync.spawn_periodic();

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if let SyncEvent::DataRefreshed { .. } = event {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    services.detector.stop();
    services.log_sync.stop_periodic();
    info!("Shutting down");
    Ok(())
}
