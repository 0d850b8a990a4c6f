//! CareVista offline core: maintenance CLI.
//!
//! Inspects and maintains the on-device store:
//! - `status`: sync status and queue summary
//! - `retry [local_id]`: put permanently failed items back in line
//! - `gc`: release bytes of deleted, already-synced media

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use carevista::adapters::sanitize::SanitizingMakeWriter;
use carevista::adapters::{NoRemote, SqliteStore, SystemClock};
use carevista::application::OfflineCore;
use carevista::ports::Clock;
use carevista::SyncConfig;

fn main() -> Result<()> {
    // Logs go to stderr on a terminal so they do not mix with command output.
    let log_mode = std::env::var("CAREVISTA_LOG_MODE").unwrap_or_else(|_| "auto".to_string());
    let use_file = match log_mode.as_str() {
        "file" => true,
        "stderr" => false,
        _ => !std::io::stderr().is_terminal(),
    };

    let (writer, _guard) = if use_file {
        let log_file =
            std::env::var("CAREVISTA_LOG_FILE").unwrap_or_else(|_| "carevista.log".to_string());

        if let Some(parent) = std::path::Path::new(&log_file).parent() {
            // Best-effort: don't fail startup just because the directory is missing.
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("opening log file {log_file}"))?;
        tracing_appender::non_blocking(file)
    } else {
        tracing_appender::non_blocking(std::io::stderr())
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();

    let config = SyncConfig::from_env_or_default();
    let store = SqliteStore::new(&config.db_path)
        .with_context(|| format!("opening store at {}", config.db_path.display()))?
        .with_quota(config.storage_quota_bytes);

    // Maintenance commands never drain; any accidental attempt fails as unreachable.
    let remote = Arc::new(NoRemote);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let core = OfflineCore::new(Arc::new(store), remote, clock, config);

    let recovered = core.recover()?;
    if recovered > 0 {
        tracing::info!("Re-queued {} unsynced write(s)", recovered);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("status") => print_status(&core)?,
        Some("retry") => {
            let reset = match args.get(1) {
                Some(local_id) => usize::from(core.queue.retry_failed(local_id)?),
                None => core.queue.retry_all_failed()?,
            };
            println!("{reset} item(s) scheduled for retry");
        }
        Some("gc") => {
            let released = core.records.collect_garbage()?;
            println!("Released bytes of {released} media blob(s)");
        }
        Some(other) => bail!("unknown command `{other}` (expected status, retry or gc)"),
    }

    Ok(())
}

fn print_status(core: &OfflineCore<SqliteStore, NoRemote>) -> Result<()> {
    let status = core.queue.status()?;

    println!("Pending items:  {}", status.pending_count);
    match status.last_sync_at {
        Some(at) => println!("Last sync:      {}", at.to_rfc3339()),
        None => println!("Last sync:      never"),
    }
    if let Some(err) = &status.last_error {
        println!("Last error:     {err}");
    }

    if status.has_errors() {
        println!("Failed items (run `carevista retry` to try again):");
        for report in &status.errors {
            println!(
                "  {} [{}] after {} attempts: {}",
                report.local_id,
                report.entity_type,
                report.attempt_count,
                report.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}
