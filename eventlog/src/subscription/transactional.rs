//! Exactly-once subscription passes.
//!
//! A [`TransactionalCursor`] runs a pass inside store transactions. Each
//! transaction covers a batch of yielded envelopes, the writes the caller
//! makes while handling them, and the subscription record. Either all of it
//! is committed or none of it is.

use super::{ListenerState, Progress, SubscriptionCursor, SubscriptionDao};
use crate::config::TransactionalConfig;
use crate::envelope::Envelope;
use crate::errors::{SubscriptionError, SubscriptionResult};
use crate::store::Transactional;
use tracing::{debug, warn};

/// Snapshot taken when a batch opens, restored if it rolls back.
struct Savepoint {
    progress: Progress,
    state: Option<ListenerState>,
}

/// A [`SubscriptionCursor`] whose progress and store writes commit together.
///
/// A transaction is opened on the first pull. Once `batch_size` envelopes
/// were yielded, the next pull saves the subscription record and commits,
/// so the writes made while handling the last envelope are included. The
/// final batch commits when the pass ends. Errors, and dropping the cursor
/// with a batch open, roll the batch back and rewind the subscription to the
/// last committed progress.
pub struct TransactionalCursor<'a> {
    cursor: SubscriptionCursor<'a>,
    tx: &'a dyn Transactional,
    dao: &'a dyn SubscriptionDao,
    batch_size: usize,
    yielded: usize,
    savepoint: Option<Savepoint>,
    finished: bool,
}

impl std::fmt::Debug for TransactionalCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalCursor")
            .field("cursor", &self.cursor)
            .field("batch_size", &self.batch_size)
            .field("yielded", &self.yielded)
            .field("open", &self.savepoint.is_some())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a> TransactionalCursor<'a> {
    /// Wraps `cursor`. `tx` must scope the writes of both the store the
    /// caller writes to and `dao`.
    pub fn new(
        cursor: SubscriptionCursor<'a>,
        tx: &'a dyn Transactional,
        dao: &'a dyn SubscriptionDao,
        config: TransactionalConfig,
    ) -> Self {
        Self {
            cursor,
            tx,
            dao,
            batch_size: config.batch_size.into_inner(),
            yielded: 0,
            savepoint: None,
            finished: false,
        }
    }

    /// The underlying pass.
    pub const fn cursor(&self) -> &SubscriptionCursor<'a> {
        &self.cursor
    }

    fn begin(&mut self) -> SubscriptionResult<()> {
        self.tx.begin()?;
        let subscription = &*self.cursor.subscription;
        self.savepoint = Some(Savepoint {
            progress: subscription.progress(),
            state: subscription
                .listener
                .as_stateful()
                .map(|stateful| stateful.to_state()),
        });
        self.yielded = 0;
        Ok(())
    }

    fn commit(&mut self) -> SubscriptionResult<()> {
        let subscription = &mut *self.cursor.subscription;
        let saved = self
            .dao
            .save(&subscription.record(), subscription.committed_version)
            .map_err(SubscriptionError::from)
            .and_then(|()| self.tx.commit().map_err(SubscriptionError::from));

        match saved {
            Ok(()) => {
                subscription.mark_saved();
                self.savepoint = None;
                debug!(
                    id = %subscription.id(),
                    version = subscription.version,
                    "[subscription.transactional] batch committed"
                );
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn rollback(&mut self) {
        let Some(savepoint) = self.savepoint.take() else {
            return;
        };
        if self.tx.in_transaction() {
            if let Err(e) = self.tx.rollback() {
                warn!(error = %e, "[subscription.transactional] rollback failed");
            }
        }
        let subscription = &mut *self.cursor.subscription;
        subscription.rewind(savepoint.progress, savepoint.state);
        debug!(
            id = %subscription.id(),
            version = subscription.version,
            "[subscription.transactional] batch rolled back"
        );
    }

    fn fail(&mut self, error: SubscriptionError) -> Option<SubscriptionResult<Envelope>> {
        self.rollback();
        self.finished = true;
        Some(Err(error))
    }
}

impl Iterator for TransactionalCursor<'_> {
    type Item = SubscriptionResult<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.savepoint.is_some() && self.yielded >= self.batch_size {
            if let Err(e) = self.commit() {
                self.finished = true;
                return Some(Err(e));
            }
        }

        if self.savepoint.is_none() {
            if let Err(e) = self.begin() {
                self.finished = true;
                return Some(Err(e));
            }
        }

        match self.cursor.next() {
            Some(Ok(envelope)) => {
                self.yielded += 1;
                Some(Ok(envelope))
            }
            Some(Err(e)) => self.fail(e),
            None => {
                self.finished = true;
                self.commit().err().map(Err)
            }
        }
    }
}

impl Drop for TransactionalCursor<'_> {
    fn drop(&mut self) {
        if self.savepoint.is_some() {
            warn!("[subscription.transactional] cursor dropped with an open batch");
            self.rollback();
        }
    }
}
