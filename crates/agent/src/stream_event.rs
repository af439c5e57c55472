//! Live view of a background run.
//!
//! [`RunEventStream`] yields every event the run publishes, in order, and
//! ends once the run is over. Dropping it cancels the run.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use toolwright_core::event::Event;

use crate::error::AgentError;
use crate::loop_runner::RunOutcome;

pub struct RunEventStream {
    events: UnboundedReceiverStream<Event>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<RunOutcome>>,
}

impl RunEventStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Event>,
        cancel: CancellationToken,
        handle: JoinHandle<RunOutcome>,
    ) -> Self {
        Self {
            events: UnboundedReceiverStream::new(rx),
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancel the run without dropping the stream. Events published while
    /// the run winds down are still delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish. Unread events are discarded.
    pub async fn outcome(mut self) -> Result<RunOutcome, AgentError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| AgentError::Join("run outcome already taken".into()))?;
        handle.await.map_err(|err| AgentError::Join(err.to_string()))
    }
}

impl Stream for RunEventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for RunEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
