//! # Worker Loop
//!
//! Pumps the transport under bounded parallelism and drives the incoming
//! pipeline for every received message. Exceptions never escape a worker:
//! the outermost catch-all guarantees abort + dispose and loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bottleneck::Bottleneck;
use crate::envelope::{headers, TransportMessage};
use crate::error::{BusError, Result};
use crate::pipeline::{keys, Pipeline, StepContext};
use crate::transaction::{TransactionContext, ERROR_DETAILS_KEY};
use crate::transport::Transport;

/// Idle back-off: starts small so a busy queue stays hot, doubles up to a
/// second while the queue is empty.
struct IdleBackoff {
    current: Duration,
}

impl IdleBackoff {
    const FLOOR: Duration = Duration::from_millis(10);
    const CEILING: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self {
            current: Self::FLOOR,
        }
    }

    fn reset(&mut self) {
        self.current = Self::FLOOR;
    }

    async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(Self::CEILING);
    }
}

/// Everything one worker needs to pump messages.
pub(crate) struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub pipeline: Pipeline,
    pub parallelism: Bottleneck,
    pub receive_gate: Bottleneck,
    pub running: Arc<AtomicBool>,
    pub shutdown: Arc<Notify>,
    pub error_queue_address: String,
}

/// Spawn one named worker task.
pub(crate) fn spawn_worker(name: String, ctx: Arc<WorkerContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(worker = %name, "worker started");
        run_loop(&name, &ctx).await;
        debug!(worker = %name, "worker stopped");
    })
}

async fn run_loop(name: &str, ctx: &WorkerContext) {
    let mut idle = IdleBackoff::new();

    while ctx.running.load(Ordering::SeqCst) {
        // Admission first: a message is only pulled once it may also run.
        let token = tokio::select! {
            token = ctx.parallelism.enter() => token,
            _ = ctx.shutdown.notified() => break,
        };
        let Ok(_token) = token else { break };

        let tx = Arc::new(TransactionContext::new());
        let received = {
            let Ok(_receive_permit) = ctx.receive_gate.enter().await else {
                break;
            };
            ctx.transport.receive(&tx).await
        };

        match received {
            Ok(Some(message)) => {
                idle.reset();
                process_message(name, ctx, tx, message).await;
            }
            Ok(None) => {
                tx.dispose().await;
                if ctx.running.load(Ordering::SeqCst) {
                    idle.wait().await;
                }
            }
            Err(err) => {
                warn!(worker = %name, %err, "receive failed");
                let _ = tx.abort().await;
                tx.dispose().await;
                idle.wait().await;
            }
        }
    }
}

/// Run the incoming pipeline for one message and drive the transaction to
/// its terminal state. Never returns an error.
async fn process_message(
    name: &str,
    ctx: &WorkerContext,
    tx: Arc<TransactionContext>,
    message: TransportMessage,
) {
    let message = Arc::new(message);
    let step_ctx = StepContext::new();
    step_ctx.insert_arc(keys::TRANSPORT_MESSAGE, message.clone());
    step_ctx.insert_arc(keys::TRANSACTION, tx.clone());

    let outcome = ctx.pipeline.process(step_ctx).await;

    match outcome {
        Ok(()) => {
            if let Err(err) = tx.commit().await {
                // The transaction is terminal; an undecided peek lock is
                // abandoned on dispose and the message redelivered.
                error!(worker = %name, %err, "commit failed");
            }
        }
        Err(err) if err.is_poison() => {
            dead_letter(name, ctx, &tx, &message, &err).await;
        }
        Err(err) => {
            debug!(worker = %name, %err, "message processing failed, aborting");
            tx.insert(ERROR_DETAILS_KEY, err.to_string());
            if let Err(abort_err) = tx.abort().await {
                error!(worker = %name, %abort_err, "abort failed");
            }
        }
    }
    tx.dispose().await;
}

/// Forward a poison message to the dead-letter queue with its original
/// headers plus `rbs2-error-details`, then commit: the forward and the ack
/// of the original delivery succeed or fail together.
async fn dead_letter(
    name: &str,
    ctx: &WorkerContext,
    tx: &Arc<TransactionContext>,
    message: &TransportMessage,
    err: &BusError,
) {
    warn!(worker = %name, %err, queue = %ctx.error_queue_address, "dead-lettering poison message");

    let mut poisoned = message.clone();
    poisoned
        .headers
        .insert(headers::ERROR_DETAILS.to_string(), err.to_string());

    let forwarded: Result<()> = async {
        ctx.transport
            .send(&ctx.error_queue_address, poisoned, tx)
            .await?;
        tx.commit().await
    }
    .await;

    if let Err(forward_err) = forwarded {
        error!(worker = %name, %forward_err, "failed to dead-letter, abandoning for redelivery");
        tx.insert(ERROR_DETAILS_KEY, err.to_string());
        let _ = tx.abort().await;
    }
}
