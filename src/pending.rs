//! Request/reply correlation.
//!
//! Every in-flight request owns a single-use wait slot keyed by its id. The
//! reader task resolves slots as replies arrive; the disconnect path
//! interrupts whatever is left and closes the table so nothing can register
//! against a dead session. A waiter that is dropped before its outcome
//! arrives takes its entry with it.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    message::Message,
};

/// Terminal signal delivered to a wait slot.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The reply routed by id.
    Reply(Message),
    /// The session went away first.
    Interrupted,
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    inner: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    /// Session the table is open for, if any.
    epoch: Option<u64>,
    slots: HashMap<String, oneshot::Sender<Outcome>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, Table> {
        // The table is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept registrations for session `epoch`.
    pub(crate) fn open(&self, epoch: u64) {
        let mut table = self.lock();
        debug_assert!(table.slots.is_empty());
        table.epoch = Some(epoch);
    }

    /// Register a wait slot for `id` in session `epoch`.
    ///
    /// Fails with [`Error::Interrupted`] unless the table is open for
    /// `epoch`, and with [`Error::InvalidRequest`] if `id` is already in
    /// flight.
    pub(crate) fn register(&self, id: &str, epoch: u64) -> Result<Waiter<'_>> {
        let mut table = self.lock();
        if table.epoch != Some(epoch) {
            return Err(Error::Interrupted);
        }
        if table.slots.contains_key(id) {
            return Err(Error::invalid_request(format!(
                "request id '{id}' is already in flight"
            )));
        }

        let (tx, rx) = oneshot::channel();
        table.slots.insert(id.to_string(), tx);
        Ok(Waiter {
            table: self,
            id: id.to_string(),
            rx,
            settled: false,
        })
    }

    /// Deliver `reply` to the slot registered for `id`.
    ///
    /// Hands the message back when no such slot exists.
    pub(crate) fn resolve(&self, id: &str, reply: Message) -> std::result::Result<(), Message> {
        let tx = self.lock().slots.remove(id);
        match tx {
            Some(tx) => {
                // The waiter may have timed out in the meantime; the reply is then moot.
                let _ = tx.send(Outcome::Reply(reply));
                Ok(())
            }
            None => Err(reply),
        }
    }

    fn remove(&self, id: &str) {
        self.lock().slots.remove(id);
    }

    /// Close the table and interrupt every outstanding slot.
    ///
    /// Returns how many slots were interrupted.
    pub(crate) fn interrupt_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.lock();
            table.epoch = None;
            table.slots.drain().collect()
        };

        let count = drained.len();
        for (id, tx) in drained {
            tracing::debug!(id = %id, "cancelling pending execution");
            let _ = tx.send(Outcome::Interrupted);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }
}

/// The caller's side of a registered slot.
///
/// Dropping it before [`Waiter::outcome`] completes unregisters the id, so a
/// caller that gives up (timeout, cancellation, or a dropped future) never
/// leaves an entry behind.
#[derive(Debug)]
pub(crate) struct Waiter<'a> {
    table: &'a PendingTable,
    id: String,
    rx: oneshot::Receiver<Outcome>,
    settled: bool,
}

impl Waiter<'_> {
    /// Wait for the reply or the interruption.
    pub(crate) async fn outcome(&mut self) -> Outcome {
        let outcome = (&mut self.rx).await.unwrap_or(Outcome::Interrupted);
        // Whoever sent the outcome already took the entry out.
        self.settled = true;
        outcome
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.table.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: &str) -> Message {
        let mut msg = Message::new();
        msg.insert("return", json!({}));
        msg.insert("id", json!(id));
        msg
    }

    #[tokio::test]
    async fn resolves_exactly_the_matching_slot() {
        let table = PendingTable::default();
        table.open(1);

        let mut a = table.register("a", 1).unwrap();
        let mut b = table.register("b", 1).unwrap();

        table.resolve("b", reply("b")).unwrap();
        assert_eq!(table.len(), 1);

        match b.outcome().await {
            Outcome::Reply(msg) => assert_eq!(msg.id(), Some(&json!("b"))),
            Outcome::Interrupted => panic!("expected reply"),
        }

        table.resolve("a", reply("a")).unwrap();
        assert!(matches!(a.outcome().await, Outcome::Reply(_)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unknown_ids_are_handed_back() {
        let table = PendingTable::default();
        table.open(1);
        let _slot = table.register("known", 1).unwrap();

        let returned = table.resolve("X", reply("X")).unwrap_err();
        assert_eq!(returned.id(), Some(&json!("X")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let table = PendingTable::default();
        table.open(1);
        let _slot = table.register("dup", 1).unwrap();

        let err = table.register("dup", 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Usage);
    }

    #[tokio::test]
    async fn interrupt_all_drains_and_closes() {
        let table = PendingTable::default();
        table.open(1);
        let mut slots: Vec<_> = (0..4)
            .map(|i| table.register(&format!("r{i}"), 1).unwrap())
            .collect();

        assert_eq!(table.interrupt_all(), 4);
        assert_eq!(table.len(), 0);

        for slot in &mut slots {
            assert!(matches!(slot.outcome().await, Outcome::Interrupted));
        }

        assert!(matches!(table.register("late", 1), Err(Error::Interrupted)));
        assert_eq!(table.interrupt_all(), 0);
    }

    #[test]
    fn closed_until_opened() {
        let table = PendingTable::default();
        assert!(matches!(table.register("early", 1), Err(Error::Interrupted)));
        table.open(1);
        assert!(table.register("early", 1).is_ok());
    }

    #[test]
    fn registrations_from_another_session_are_refused() {
        let table = PendingTable::default();
        table.open(2);
        assert!(matches!(table.register("old", 1), Err(Error::Interrupted)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn dropped_waiters_unregister() {
        let table = PendingTable::default();
        table.open(1);

        let waiter = table.register("gone", 1).unwrap();
        assert_eq!(table.len(), 1);
        drop(waiter);
        assert_eq!(table.len(), 0);

        // Abandoned mid-wait.
        let mut waiter = table.register("late", 1).unwrap();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), waiter.outcome()).await;
        assert!(waited.is_err());
        drop(waiter);
        assert_eq!(table.len(), 0);

        // A settled waiter leaves a reused id alone.
        let mut first = table.register("reused", 1).unwrap();
        table.resolve("reused", reply("reused")).unwrap();
        assert!(matches!(first.outcome().await, Outcome::Reply(_)));
        let _second = table.register("reused", 1).unwrap();
        drop(first);
        assert_eq!(table.len(), 1);
    }
}
