use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use portal_core::{PortalError, QueryRequest, QueryResult};
use portal_logging::portal_error;

use crate::orchestrator::Orchestrator;

pub type JobId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    QueryStarted {
        job_id: JobId,
        plugin_id: String,
    },
    QueryCompleted {
        job_id: JobId,
        result: Result<QueryResult, PortalError>,
    },
    /// The worker thread could not start; no jobs will run.
    Unavailable { message: String },
}

enum EngineCommand {
    Run { job_id: JobId, request: QueryRequest },
    Cancel { job_id: JobId },
}

/// Synchronous front for an `Orchestrator` running on its own runtime thread.
///
/// Jobs run concurrently; results arrive as `EngineEvent`s in completion order.
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    event_rx: mpsc::Receiver<EngineEvent>,
}

impl EngineHandle {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let orchestrator = Arc::new(orchestrator);

        thread::spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(err) => {
                    portal_error!("engine runtime failed to start: {}", err);
                    let _ = event_tx.send(EngineEvent::Unavailable {
                        message: err.to_string(),
                    });
                    return;
                }
            };
            let tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>> = Arc::default();
            while let Ok(command) = cmd_rx.recv() {
                match command {
                    EngineCommand::Run { job_id, request } => {
                        let token = CancellationToken::new();
                        tokens
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(job_id, token.clone());
                        let orchestrator = orchestrator.clone();
                        let tokens = tokens.clone();
                        let event_tx = event_tx.clone();
                        runtime.spawn(async move {
                            let _ = event_tx.send(EngineEvent::QueryStarted {
                                job_id,
                                plugin_id: request.plugin_id().to_string(),
                            });
                            let result = orchestrator.run_query_with_cancel(request, token).await;
                            tokens
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&job_id);
                            let _ = event_tx.send(EngineEvent::QueryCompleted { job_id, result });
                        });
                    }
                    EngineCommand::Cancel { job_id } => {
                        if let Some(token) = tokens
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get(&job_id)
                        {
                            token.cancel();
                        }
                    }
                }
            }
        });

        Self { cmd_tx, event_rx }
    }

    pub fn enqueue(&self, job_id: JobId, request: QueryRequest) {
        let _ = self.cmd_tx.send(EngineCommand::Run { job_id, request });
    }

    /// Cancels a queued or running job; unknown ids are ignored.
    pub fn cancel(&self, job_id: JobId) {
        let _ = self.cmd_tx.send(EngineCommand::Cancel { job_id });
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }
}
