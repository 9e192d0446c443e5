//! Subcommand handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use envivo_core::{
    load_rules_file, supervise, Dispatcher, Enricher, EnvivoConfig, FeedClient, RelayServer,
    RuleClient, StreamSession, TerminalSink,
};

fn rule_client(config: &EnvivoConfig) -> Result<RuleClient> {
    let client = FeedClient::new(&config.api).context("Failed to create API client")?;
    Ok(RuleClient::new(client))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render response")?;
    println!("{rendered}");
    Ok(())
}

/// Locate a rules file: an existing path is used as is, anything else is
/// looked up in `rules_dir`
fn resolve_rules_file(file: &Path, rules_dir: &Path) -> PathBuf {
    if file.is_file() {
        file.to_path_buf()
    } else {
        rules_dir.join(file)
    }
}

// ============================================================================
// Rules
// ============================================================================

/// `envivo add`
pub async fn add(config: &EnvivoConfig, file: &Path, rules_dir: &Path, dry_run: bool) -> Result<()> {
    let path = resolve_rules_file(file, rules_dir);
    let request = load_rules_file(&path)?;
    info!(path = %path.display(), rules = request.add.len(), dry_run, "Submitting rules");

    let response = rule_client(config)?
        .add_rules(&request, dry_run)
        .await
        .context("Failed to add rules")?;
    print_json(&response)
}

/// `envivo check`
pub async fn check(config: &EnvivoConfig) -> Result<()> {
    let rules = rule_client(config)?
        .fetch_rules()
        .await
        .context("Failed to fetch rules")?;
    print_json(&rules)
}

/// `envivo delete`
pub async fn delete(config: &EnvivoConfig, ids: &[String]) -> Result<()> {
    let response = rule_client(config)?
        .delete_rules(ids)
        .await
        .context("Failed to delete rules")?;
    print_json(&response)
}

/// `envivo delete-all`
pub async fn delete_all(config: &EnvivoConfig) -> Result<()> {
    match rule_client(config)?
        .delete_all_rules()
        .await
        .context("Failed to delete rules")?
    {
        Some(response) => print_json(&response),
        None => {
            println!("no rules to delete");
            Ok(())
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// `envivo stream`
///
/// Runs until the remote ends the stream or `shutdown` is cancelled. With the
/// relay enabled, records queued for the browser are flushed before the relay
/// server stops.
pub async fn stream(config: EnvivoConfig, shutdown: CancellationToken) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(Box::new(TerminalSink::stdout(
        config.terminal.style,
    ))));

    let relay_cancel = CancellationToken::new();
    let relay = if config.relay.enabled {
        let server = RelayServer::bind(config.relay.clone(), Arc::clone(&dispatcher))
            .await
            .context("Failed to start websocket relay")?;
        info!(addr = ?server.local_addr().ok(), path = %config.relay.path, "Websocket relay enabled");
        Some(tokio::spawn(server.run(relay_cancel.clone())))
    } else {
        None
    };

    let client = FeedClient::new(&config.api).context("Failed to create API client")?;
    let enricher = Enricher::new(config.filter.language_filter());
    info!(
        languages = ?config.filter.accepted_languages,
        reconnect_attempts = config.reconnect.max_attempts,
        "Starting stream"
    );

    let result = if config.reconnect.is_enabled() {
        supervise(&config.reconnect, &shutdown, |attempt| {
            debug!(attempt, "Starting stream session");
            StreamSession::new(client.clone(), enricher.clone(), Arc::clone(&dispatcher))
                .with_parent_cancellation(&shutdown)
                .keep_sinks_open()
                .start()
        })
        .await
    } else {
        let session = StreamSession::new(client, enricher, Arc::clone(&dispatcher))
            .with_parent_cancellation(&shutdown);
        match session.start().await {
            Ok(handle) => Ok(handle.wait().await),
            Err(e) => Err(e),
        }
    };

    // Lets the relay drain what is queued, then stops it
    dispatcher.close_sinks();
    relay_cancel.cancel();
    if let Some(relay) = relay {
        if let Err(e) = relay.await {
            warn!(error = %e, "Relay server task failed");
        }
    }

    let stats = dispatcher.stats();
    let summary = result
        .context("Failed to connect to the stream")?
        .into_result()
        .context("Stream failed")?;
    info!(
        end_reason = ?summary.end_reason,
        frames = summary.frames,
        keep_alives = summary.keep_alives,
        filtered = summary.filtered,
        dispatched = stats.dispatched,
        relayed = stats.websocket_enqueued,
        relay_dropped = stats.websocket_dropped,
        "Stream finished"
    );
    Ok(())
}
