//! Loading subscriptions from their persisted records.

use super::{Listener, Subscription, SubscriptionDao};
use crate::clock::Clock;
use crate::errors::SubscriptionResult;
use crate::types::Id;
use std::sync::Arc;
use tracing::warn;

/// Creates listeners by id.
pub trait ListenerFactory: Send + Sync {
    /// Returns a fresh listener for `id`, or `None` if the id is unknown.
    fn create(&self, id: &Id) -> Option<Box<dyn Listener>>;
}

impl<F> ListenerFactory for F
where
    F: Fn(&Id) -> Option<Box<dyn Listener>> + Send + Sync,
{
    fn create(&self, id: &Id) -> Option<Box<dyn Listener>> {
        self(id)
    }
}

/// Rebuilds subscriptions from a [`SubscriptionDao`].
pub struct SubscriptionRepository {
    dao: Arc<dyn SubscriptionDao>,
    factory: Arc<dyn ListenerFactory>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SubscriptionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRepository").finish_non_exhaustive()
    }
}

impl SubscriptionRepository {
    /// Creates a repository.
    pub fn new(
        dao: Arc<dyn SubscriptionDao>,
        factory: Arc<dyn ListenerFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dao,
            factory,
            clock,
        }
    }

    /// Loads a persisted subscription. `None` if there is no record or the
    /// factory does not know the id.
    pub fn find(&self, id: &Id) -> SubscriptionResult<Option<Subscription>> {
        let Some(record) = self.dao.one(id)? else {
            return Ok(None);
        };
        let Some(listener) = self.factory.create(id) else {
            warn!(%id, "[subscription.repository] no listener for persisted subscription");
            return Ok(None);
        };
        Subscription::restore(listener, record, Arc::clone(&self.clock)).map(Some)
    }

    /// Loads a persisted subscription, or creates an unstarted one.
    pub fn find_or_create(&self, id: &Id) -> SubscriptionResult<Option<Subscription>> {
        if let Some(subscription) = self.find(id)? {
            return Ok(Some(subscription));
        }
        Ok(self
            .factory
            .create(id)
            .map(|listener| Subscription::new(listener, Arc::clone(&self.clock))))
    }

    /// Returns true if a record exists for `id`.
    pub fn has(&self, id: &Id) -> SubscriptionResult<bool> {
        Ok(self.dao.exists(id)?)
    }

    /// Loads every persisted subscription the factory knows.
    pub fn all(&self) -> SubscriptionResult<Vec<Subscription>> {
        let mut subscriptions = Vec::new();
        for record in self.dao.all()? {
            match self.factory.create(&record.id) {
                Some(listener) => {
                    subscriptions.push(Subscription::restore(listener, record, Arc::clone(&self.clock))?);
                }
                None => warn!(id = %record.id, "[subscription.repository] skipping unknown listener"),
            }
        }
        Ok(subscriptions)
    }
}
