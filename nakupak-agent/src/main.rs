//! nakupak agent: headless client that keeps a device's view of the household
//! shopping list in sync.
//!
//! Configuration comes from `NAKUPAK_*` environment variables, the credential
//! from `NAKUPAK_TOKEN`. Commands are read line by line from stdin:
//!
//! ```text
//! status | list | session | refresh | replay | logout | quit
//! start | complete | abort
//! toggle <session_item_id>
//! add <item_id> <quantity> [unit]
//! qty <list_item_id> <quantity>
//! remove <list_item_id>
//! purchase
//! ```

use log::info;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use nakupak_sync::{
    ClientConfig, Credentials, MutationOutcome, NetworkMonitor, SyncEngine, SyncError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ClientConfig::from_env()?;
    let credentials = Arc::new(Credentials::new(std::env::var("NAKUPAK_TOKEN").ok()));
    if !credentials.is_present() {
        log::warn!("NAKUPAK_TOKEN not set; realtime updates stay off until login");
    }

    info!("Starting nakupak agent against {}", config.api_base);
    let engine = SyncEngine::new(config.clone(), credentials)?;
    engine.start().await?;

    // Reachability checks feed the coordinator
    let (tx, rx) = mpsc::channel(8);
    let monitor = NetworkMonitor::from_config(&config)?.spawn(tx);
    let coordinator = engine.connectivity().clone().spawn(rx);

    let mut events = engine.mutations().subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log::debug!("{:?} {:?}: {:?}", event.kind, event.target, event.phase);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                match run(&engine, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {e}"),
                }
            }
        }
    }

    monitor.abort();
    coordinator.abort();
    event_log.abort();
    engine.shutdown().await;
    Ok(())
}

/// Execute one command. Returns false when the agent should exit.
async fn run(engine: &SyncEngine, line: &str) -> Result<bool, SyncError> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };
    let args: Vec<&str> = words.collect();

    match command {
        "quit" | "exit" => return Ok(false),
        "status" => {
            let state = engine.connectivity().connection_state();
            println!(
                "channel: {:?}, offline: {}, pending actions: {}",
                state.channel_status,
                state.offline,
                engine.pending_actions().await
            );
        }
        "list" => {
            for entry in engine.list().list_items().await {
                let mark = if entry.checked { "x" } else { " " };
                println!(
                    "[{mark}] #{:<5} {} {} {}",
                    entry.id, entry.item.name, entry.quantity, entry.unit
                );
            }
        }
        "session" => match engine.session().snapshot().await {
            Some(session) => {
                println!(
                    "session {}: {}/{} checked",
                    session.id,
                    engine.session().checked_count().await,
                    session.session_items.len()
                );
                for line in &session.session_items {
                    let mark = if line.checked { "x" } else { " " };
                    println!("[{mark}] #{:<5} {}", line.id, line.item_name);
                }
            }
            None => println!("no active session"),
        },
        "refresh" => engine.refresh().await?,
        "replay" => {
            let report = engine.connectivity().replay().await?;
            println!(
                "replayed {}, remaining {}",
                report.replayed, report.remaining
            );
            if let Some(error) = &report.halt_error {
                let hint = if report.may_retry() {
                    "will retry when online"
                } else {
                    "rejected by server, retrying will not help"
                };
                println!("halted: {error} ({hint})");
            }
        }
        "logout" => {
            engine.logout().await;
            return Ok(false);
        }
        "start" => {
            let session = engine.session().start(engine.gateway().as_ref()).await?;
            println!("session {} started", session.id);
        }
        "complete" => {
            engine.session().complete(engine.gateway().as_ref()).await?;
            engine.list().refresh_list(engine.gateway().as_ref()).await?;
        }
        "abort" => engine.session().abort(engine.gateway().as_ref()).await?,
        "toggle" => {
            let Some(id) = arg(&args, 0) else {
                return usage(command);
            };
            report(engine.mutations().toggle_check(id).await?);
        }
        "add" => {
            let (Some(item_id), Some(quantity)) = (arg(&args, 0), arg(&args, 1)) else {
                return usage(command);
            };
            let unit = args.get(2).copied().unwrap_or("ks");
            report(engine.mutations().add_item(item_id, quantity, unit).await?);
        }
        "qty" => {
            let (Some(id), Some(quantity)) = (arg(&args, 0), arg(&args, 1)) else {
                return usage(command);
            };
            report(engine.mutations().update_quantity(id, quantity, None).await?);
        }
        "remove" => {
            let Some(id) = arg(&args, 0) else {
                return usage(command);
            };
            report(engine.mutations().remove_item(id).await?);
        }
        "purchase" => report(engine.mutations().purchase().await?),
        other => println!("unknown command: {other}"),
    }
    Ok(true)
}

fn report(outcome: MutationOutcome) {
    match outcome {
        MutationOutcome::Confirmed => println!("ok"),
        MutationOutcome::Queued { queue_id } => println!("offline, queued as #{queue_id}"),
        MutationOutcome::RolledBack { error } => println!("failed, reverted: {error}"),
        MutationOutcome::Skipped => println!("nothing to do"),
    }
}

fn usage(command: &str) -> Result<bool, SyncError> {
    println!("usage: {}", usage_line(command));
    Ok(true)
}

fn usage_line(command: &str) -> &'static str {
    match command {
        "toggle" => "toggle <session_item_id>",
        "add" => "add <item_id> <quantity> [unit]",
        "qty" => "qty <list_item_id> <quantity>",
        "remove" => "remove <list_item_id>",
        _ => "status | list | session | refresh | replay | logout | quit",
    }
}

/// Positional argument `index`, if present and parseable.
fn arg<T: std::str::FromStr>(args: &[&str], index: usize) -> Option<T> {
    args.get(index)?.parse().ok()
}
