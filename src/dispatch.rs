//! Hand-off of committed events to an external publisher.
//!
//! After a successful write every committed domain event and every
//! out-of-band event is offered to the configured [`Dispatcher`] together
//! with its flattened descriptor headers. Delivery is at-least-once: a
//! commit that is retried after a dispatch failure is detected as a
//! duplicate by the store and dispatched again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::event::{Headers, ProposedEvent};

/// A committed event as handed to a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEvent {
    /// Id of the event.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: Value,
    /// Descriptor and commit headers, see
    /// [`EventDescriptor::to_headers`](crate::EventDescriptor::to_headers).
    pub headers: Headers,
}

impl OutgoingEvent {
    pub(crate) fn from_proposed(proposed: &ProposedEvent, commit_headers: &Headers) -> Self {
        let mut descriptor = proposed.descriptor.clone();
        descriptor.commit_headers.extend(
            commit_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let mut headers = descriptor.to_headers();
        headers.insert("Aggregates.EventId".into(), proposed.event_id.to_string());
        Self {
            event_id: proposed.event_id,
            event_type: proposed.event_type.clone(),
            payload: proposed.payload.clone(),
            headers,
        }
    }
}

/// Publisher of committed events.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Publish `events` committed to `stream`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if the events could not be handed off.
    async fn dispatch(&self, stream: &str, events: &[OutgoingEvent]) -> Result<(), DispatchError>;
}

/// Dispatcher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

#[async_trait]
impl Dispatcher for NullDispatcher {
    async fn dispatch(
        &self,
        _stream: &str,
        _events: &[OutgoingEvent],
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Dispatcher that forwards `(stream, event)` pairs into a tokio channel.
///
/// # Examples
///
/// ```
/// use eventfold_uow::ChannelDispatcher;
///
/// let (dispatcher, mut rx) = ChannelDispatcher::new();
/// drop(dispatcher);
/// assert!(rx.try_recv().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<(String, OutgoingEvent)>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, OutgoingEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, stream: &str, events: &[OutgoingEvent]) -> Result<(), DispatchError> {
        for event in events {
            self.tx
                .send((stream.to_owned(), event.clone()))
                .map_err(|_| DispatchError("receiver dropped".into()))?;
        }
        Ok(())
    }
}
