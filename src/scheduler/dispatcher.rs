//! Single sequence point for probe outcomes.
//!
//! Every outcome passes through here one at a time: it is folded into the
//! statistics, gets its per-target sequence number, then goes to the log file
//! and the event channel. Outcomes of targets no longer tracked are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::Sinks;
use crate::log_writer::LogWriter;
use crate::models::ProbeOutcome;

pub(super) enum Dispatch {
    Outcome(ProbeOutcome),
    TickComplete(u64),
    Forget(String),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub(super) async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Dispatch>, sinks: Sinks) {
    let mut sequences: HashMap<String, u64> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            Dispatch::Outcome(mut outcome) => {
                // Late outcomes of removed targets must not resurrect their state.
                if !sinks.stats.record(&outcome) {
                    tracing::debug!(
                        "Dispatcher: dropping outcome for removed target {}",
                        outcome.target_address
                    );
                    continue;
                }
                let seq = sequences.entry(outcome.target_id.clone()).or_insert(0);
                *seq += 1;
                outcome.sequence = *seq;
                route(&sinks, outcome).await;
            }
            Dispatch::TickComplete(tick) => {
                tracing::debug!("Dispatcher: tick {} complete", tick);
                sinks.events.publish_stats(sinks.stats.snapshot_all());
            }
            Dispatch::Forget(target_id) => {
                sequences.remove(&target_id);
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
            Dispatch::Shutdown(done) => {
                if let Err(e) = sinks.log.close() {
                    tracing::warn!("Dispatcher: failed to close log: {}", e);
                }
                let _ = done.send(());
                break;
            }
        }
    }

    tracing::debug!("Dispatcher: exiting");
}

async fn route(sinks: &Sinks, outcome: ProbeOutcome) {
    if let Err(message) = append_blocking(sinks.log.clone(), outcome.clone()).await {
        tracing::warn!("Failed to log probe outcome for {}: {}", outcome.target_address, message);
        sinks.events.publish_log_error(message);
    }

    sinks.events.publish_outcome(&outcome);
}

/// File I/O runs on the blocking pool; awaiting it keeps appends in dispatch order.
async fn append_blocking(log: Arc<LogWriter>, outcome: ProbeOutcome) -> Result<(), String> {
    match tokio::task::spawn_blocking(move || log.append(&outcome)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("log writer task failed: {}", e)),
    }
}
