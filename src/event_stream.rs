//! Event fan-out and the public event stream.

use futures_core::Stream;
use std::{
    pin::Pin,
    sync::{Mutex, PoisonError},
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::{Error, Result},
    types::Event,
};

/// Subscriber list shared by the reader task and [`crate::Client::events`].
///
/// Each subscriber has its own unbounded queue, so a slow consumer never
/// stalls message routing.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventStream::new(rx)
    }

    /// Queue `event` for every live subscriber, pruning dropped ones.
    pub(crate) fn publish(&self, event: &Event) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// End every current subscription.
    pub(crate) fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A subscription to QMP events.
///
/// Yields events in arrival order and ends when the session disconnects.
/// This type implements [`Stream`], but it does **not** expose Tokio types in
/// the public API.
#[derive(Debug)]
pub struct EventStream {
    inner: UnboundedReceiverStream<Event>,
}

impl EventStream {
    fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Receive the next event.
    ///
    /// Returns [`Error::Disconnected`] once the session has ended and every
    /// buffered event has been consumed.
    pub async fn recv(&mut self) -> Result<Event> {
        use tokio_stream::StreamExt;

        self.inner.next().await.ok_or(Error::Disconnected)
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(name: &str) -> Event {
        Event {
            name: name.to_string(),
            data: Value::Null,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(&event("STOP"));
        hub.publish(&event("RESUME"));

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.recv().await.unwrap().name, "STOP");
            assert_eq!(stream.recv().await.unwrap().name, "RESUME");
        }
    }

    #[tokio::test]
    async fn close_ends_streams_after_buffered_events() {
        let hub = EventHub::default();
        let mut stream = hub.subscribe();

        hub.publish(&event("SHUTDOWN"));
        hub.close();

        assert_eq!(stream.recv().await.unwrap().name, "SHUTDOWN");
        assert!(matches!(stream.recv().await, Err(Error::Disconnected)));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::default();
        let stream = hub.subscribe();
        drop(stream);

        hub.publish(&event("STOP"));
        assert!(hub.subscribers.lock().unwrap().is_empty());
    }
}
