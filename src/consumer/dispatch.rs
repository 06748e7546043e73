use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

use super::hooks::ConsumerHooks;
use crate::batch::EventBatch;
use crate::error::Result;
use crate::store::StreamStore;
use crate::types::{ConsumerIdentity, EventId};

/// What happened to the events of one dispatched batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Handled successfully and acknowledged
    pub acked: Vec<EventId>,

    /// Handler returned `false`
    pub rejected: Vec<EventId>,

    /// Handler returned an error or panicked
    pub errored: Vec<EventId>,

    /// Entries of the reply that could not be parsed
    pub skipped: usize,
}

impl DispatchSummary {
    /// Events left pending for a later replay
    pub fn failed(&self) -> usize {
        self.rejected.len() + self.errored.len()
    }

    /// Events handed to the handler
    pub fn handled(&self) -> usize {
        self.acked.len() + self.failed()
    }
}

/// Hand every event of a batch to `on_event`, in order, one at a time
///
/// Successful events are acknowledged immediately. Failed events are left
/// unacknowledged and processing moves on to the next event. Store errors
/// (the acknowledgement itself failing) abort the batch and are returned.
pub async fn dispatch_batch<S, H>(
    store: &S,
    identity: &ConsumerIdentity,
    hooks: &H,
    batch: &EventBatch,
) -> Result<DispatchSummary>
where
    S: StreamStore + ?Sized,
    H: ConsumerHooks + ?Sized,
{
    let mut summary = DispatchSummary {
        skipped: batch.skipped().len(),
        ..Default::default()
    };

    for event in batch {
        let outcome = AssertUnwindSafe(hooks.on_event(event)).catch_unwind().await;

        match outcome {
            Ok(Ok(true)) => {
                let was_pending = store
                    .ack(&identity.stream_name, &identity.group_name, event.id())
                    .await?;
                if !was_pending {
                    debug!(event_id = %event.id(), "Event was no longer pending when acknowledged");
                }
                summary.acked.push(event.id().clone());
            }
            Ok(Ok(false)) => {
                debug!(event_id = %event.id(), "Handler did not accept event, leaving it pending");
                summary.rejected.push(event.id().clone());
            }
            Ok(Err(e)) => {
                warn!(event_id = %event.id(), error = %e, "Handler failed, leaving event pending");
                summary.errored.push(event.id().clone());
            }
            Err(panic) => {
                warn!(
                    event_id = %event.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked, leaving event pending"
                );
                summary.errored.push(event.id().clone());
            }
        }
    }

    Ok(summary)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
