use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::util::now_utc_millis_string;

pub mod state;
pub mod store;
#[cfg(test)]
mod tests;

pub use state::{BridgeState, RunSummary, RuntimeEvent, Stage};
pub use store::{BlobStore, FsBlobStore, run_events_key, run_summary_key};

enum BridgeCommand {
    Event(RuntimeEvent),
    Finalize {
        ts: String,
        done: oneshot::Sender<Option<RunSummary>>,
    },
}

pub struct RuntimeBridge {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    worker: JoinHandle<()>,
}

impl RuntimeBridge {
    // Must be called from within a tokio runtime. The worker owns blocking store I/O.
    pub fn spawn(store: Arc<dyn BlobStore>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let state = BridgeState::new(store);
        let worker = tokio::task::spawn_blocking(move || run_worker(state, receiver));
        Self { commands, worker }
    }

    pub fn on_runtime_event(&self, event: RuntimeEvent) {
        if self.commands.send(BridgeCommand::Event(event)).is_err() {
            warn!("runtime bridge worker is gone; dropping event");
        }
    }

    pub async fn finalize(&self) -> Option<RunSummary> {
        self.finalize_at(now_utc_millis_string()).await
    }

    pub async fn finalize_at(&self, ts: String) -> Option<RunSummary> {
        let (done, result) = oneshot::channel();
        if self.commands.send(BridgeCommand::Finalize { ts, done }).is_err() {
            warn!("runtime bridge worker is gone; cannot finalize");
            return None;
        }

        result.await.ok().flatten()
    }

    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "runtime bridge worker ended abnormally");
        }
    }
}

fn run_worker(mut state: BridgeState, mut receiver: mpsc::UnboundedReceiver<BridgeCommand>) {
    debug!("runtime bridge worker started");

    while let Some(command) = receiver.blocking_recv() {
        match command {
            BridgeCommand::Event(event) => {
                let name = event.event.clone();
                match state.handle_event(event) {
                    Ok(()) => debug!(event = %name, inflight = state.inflight_count(), "runtime event handled"),
                    Err(err) => warn!(event = %name, error = %format!("{err:#}"), "runtime event handling failed"),
                }
            }
            BridgeCommand::Finalize { ts, done } => {
                let summary = match state.finalize(&ts) {
                    Ok(summary) => summary,
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "runtime bridge finalize failed");
                        state.summary().cloned()
                    }
                };
                if done.send(summary).is_err() {
                    debug!("finalize caller went away before the reply");
                }
            }
        }
    }

    debug!("runtime bridge worker stopped");
}
