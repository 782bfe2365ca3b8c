//! Lazy, filterable views over the log.
//!
//! A [`Stream`] is a value. Every refinement returns a new stream and leaves
//! the receiver as it was, so a base stream can be shared and narrowed in
//! different ways. Nothing is read until the stream is iterated; iterating
//! again starts over from the beginning.
//!
//! Bounds are given as envelope references. They are resolved to store
//! sequences on the first pull, and a reference to an envelope the store does
//! not know yields an empty stream.

use crate::config::PageSize;
use crate::envelope::Envelope;
use crate::errors::EventStoreResult;
use crate::store::{EventFilter, EventStore, NameFilter, Order, StreamQuery};
use crate::types::{EventId, EventName, Sequence};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Inclusive(EventId),
    Exclusive(EventId),
}

/// Resolved sequence window. `after` is exclusive, `until` inclusive.
#[derive(Debug, Clone, Copy)]
struct Window {
    after: Option<Sequence>,
    until: Option<Sequence>,
}

/// An ordered, lazily evaluated sequence of envelopes.
#[derive(Clone)]
pub struct Stream<'s> {
    store: &'s dyn EventStore,
    filter: EventFilter,
    lower: Option<Bound>,
    upper: Option<Bound>,
    names: NameFilter,
    limit: Option<usize>,
    page_size: PageSize,
}

impl std::fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("filter", &self.filter)
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("names", &self.names)
            .field("limit", &self.limit)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl<'s> Stream<'s> {
    /// Opens a stream over `store`.
    pub fn new(store: &'s dyn EventStore, filter: EventFilter) -> Self {
        Self {
            store,
            filter,
            lower: None,
            upper: None,
            names: NameFilter::All,
            limit: None,
            page_size: store.stream_config().page_size,
        }
    }

    /// The store this stream reads from.
    pub fn store(&self) -> &'s dyn EventStore {
        self.store
    }

    /// The producer filter.
    pub const fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// The name filter.
    pub const fn names(&self) -> &NameFilter {
        &self.names
    }

    /// The result limit, if any.
    pub const fn result_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Replaces the producer filter.
    #[must_use]
    pub fn matching(&self, filter: EventFilter) -> Self {
        Self {
            filter,
            ..self.clone()
        }
    }

    /// Starts at `id`, inclusive. Replaces any lower bound.
    #[must_use]
    pub fn from(&self, id: EventId) -> Self {
        Self {
            lower: Some(Bound::Inclusive(id)),
            ..self.clone()
        }
    }

    /// Starts right after `id`. Replaces any lower bound.
    #[must_use]
    pub fn after(&self, id: EventId) -> Self {
        Self {
            lower: Some(Bound::Exclusive(id)),
            ..self.clone()
        }
    }

    /// Ends at `id`, inclusive. Replaces any upper bound.
    #[must_use]
    pub fn to(&self, id: EventId) -> Self {
        Self {
            upper: Some(Bound::Inclusive(id)),
            ..self.clone()
        }
    }

    /// Ends right before `id`. Replaces any upper bound.
    #[must_use]
    pub fn before(&self, id: EventId) -> Self {
        Self {
            upper: Some(Bound::Exclusive(id)),
            ..self.clone()
        }
    }

    /// Keeps only envelopes with one of these names. Clears `without`.
    #[must_use]
    pub fn only(&self, names: impl IntoIterator<Item = EventName>) -> Self {
        Self {
            names: NameFilter::only(names),
            ..self.clone()
        }
    }

    /// Drops envelopes with any of these names. Clears `only`.
    #[must_use]
    pub fn without(&self, names: impl IntoIterator<Item = EventName>) -> Self {
        Self {
            names: NameFilter::without(names),
            ..self.clone()
        }
    }

    /// Yields at most `limit` envelopes.
    #[must_use]
    pub fn limit(&self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self.clone()
        }
    }

    /// Fetches `page_size` envelopes per round trip to the store.
    #[must_use]
    pub fn with_page_size(&self, page_size: PageSize) -> Self {
        Self {
            page_size,
            ..self.clone()
        }
    }

    /// Iterates the stream from its beginning.
    pub fn iter(&self) -> StreamIter<'s> {
        StreamIter {
            stream: self.clone(),
            state: IterState::Unresolved,
        }
    }

    /// Collects the whole stream.
    pub fn to_vec(&self) -> EventStoreResult<Vec<Envelope>> {
        self.iter().collect()
    }

    /// The first envelope, if any.
    pub fn first(&self) -> EventStoreResult<Option<Envelope>> {
        let single = Self {
            limit: Some(self.limit.map_or(1, |limit| limit.min(1))),
            ..self.clone()
        };
        single.iter().next().transpose()
    }

    /// The last envelope, if any.
    ///
    /// With a limit set, the limited window is read forward and its tail
    /// returned. Otherwise a single row is read in descending order.
    pub fn last(&self) -> EventStoreResult<Option<Envelope>> {
        if self.limit.is_some() {
            let mut last = None;
            for envelope in self.iter() {
                last = Some(envelope?);
            }
            return Ok(last);
        }

        let Some(window) = self.resolve()? else {
            return Ok(None);
        };
        let mut query = self.query(window, 1);
        query.order = Order::Descending;
        Ok(self.store.read(&query)?.into_iter().next())
    }

    fn query(&self, window: Window, limit: usize) -> StreamQuery {
        StreamQuery {
            filter: self.filter.clone(),
            after: window.after,
            until: window.until,
            names: self.names.clone(),
            order: Order::Ascending,
            limit,
        }
    }

    /// Resolves envelope references to sequences. `None` means the window is
    /// empty.
    fn resolve(&self) -> EventStoreResult<Option<Window>> {
        let after = match self.lower {
            None => None,
            Some(bound) => {
                let Some(sequence) = self.sequence_of(bound)? else {
                    return Ok(None);
                };
                match bound {
                    Bound::Inclusive(_) => sequence.previous(),
                    Bound::Exclusive(_) => Some(sequence),
                }
            }
        };

        let until = match self.upper {
            None => None,
            Some(bound) => {
                let Some(sequence) = self.sequence_of(bound)? else {
                    return Ok(None);
                };
                match bound {
                    Bound::Inclusive(_) => Some(sequence),
                    Bound::Exclusive(_) => match sequence.previous() {
                        Some(previous) => Some(previous),
                        None => return Ok(None),
                    },
                }
            }
        };

        if let (Some(after), Some(until)) = (after, until) {
            if after >= until {
                return Ok(None);
            }
        }
        Ok(Some(Window { after, until }))
    }

    fn sequence_of(&self, bound: Bound) -> EventStoreResult<Option<Sequence>> {
        let (Bound::Inclusive(id) | Bound::Exclusive(id)) = bound;
        Ok(self.store.event(id)?.and_then(|envelope| envelope.sequence()))
    }
}

impl<'a, 's> IntoIterator for &'a Stream<'s> {
    type Item = EventStoreResult<Envelope>;
    type IntoIter = StreamIter<'s>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

enum IterState {
    Unresolved,
    Paging {
        query: StreamQuery,
        buffer: VecDeque<Envelope>,
        remaining: Option<usize>,
    },
    Done,
}

/// Iterator over a [`Stream`].
///
/// Pages are fetched lazily, one at a time, and the iterator only stops on
/// an empty page. Envelopes appended while iterating therefore show up
/// before the iterator ends.
pub struct StreamIter<'s> {
    stream: Stream<'s>,
    state: IterState,
}

impl std::fmt::Debug for StreamIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIter")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl StreamIter<'_> {
    fn start(&mut self) -> EventStoreResult<()> {
        if self.stream.limit == Some(0) {
            self.state = IterState::Done;
            return Ok(());
        }
        self.state = match self.stream.resolve()? {
            None => IterState::Done,
            Some(window) => IterState::Paging {
                query: self.stream.query(window, self.stream.page_size.into_inner()),
                buffer: VecDeque::new(),
                remaining: self.stream.limit,
            },
        };
        Ok(())
    }
}

impl Iterator for StreamIter<'_> {
    type Item = EventStoreResult<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, IterState::Unresolved) {
            if let Err(e) = self.start() {
                self.state = IterState::Done;
                return Some(Err(e));
            }
        }

        let IterState::Paging {
            query,
            buffer,
            remaining,
        } = &mut self.state
        else {
            return None;
        };

        if *remaining == Some(0) {
            self.state = IterState::Done;
            return None;
        }

        if buffer.is_empty() {
            let page_size = self.stream.page_size.into_inner();
            query.limit = remaining.map_or(page_size, |left| left.min(page_size));
            match self.stream.store.read(query) {
                Ok(page) if page.is_empty() => {
                    self.state = IterState::Done;
                    return None;
                }
                Ok(page) => buffer.extend(page),
                Err(e) => {
                    self.state = IterState::Done;
                    return Some(Err(e));
                }
            }
        }

        let envelope = buffer.pop_front()?;
        if let Some(sequence) = envelope.sequence() {
            query.after = Some(sequence);
        }
        if let Some(left) = remaining.as_mut() {
            *left -= 1;
        }
        Some(Ok(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EventStoreError;
    use crate::event::Event;
    use crate::types::{Id, ProducerType};
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Tick(&'static str);

    impl Event for Tick {
        fn name(&self) -> EventName {
            EventName::from(self.0)
        }
    }

    /// Bare log that counts page reads.
    #[derive(Default)]
    struct Log {
        envelopes: Mutex<Vec<Envelope>>,
        reads: Mutex<usize>,
    }

    impl EventStore for Log {
        fn add(&self, envelopes: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
            let mut log = self.envelopes.lock();
            let committed: Vec<_> = envelopes
                .into_iter()
                .enumerate()
                .map(|(offset, envelope)| {
                    let sequence = Sequence::try_new((log.len() + offset + 1) as u64).unwrap();
                    envelope.with_sequence(sequence)
                })
                .collect();
            log.extend(committed.iter().cloned());
            Ok(committed)
        }

        fn event(&self, id: EventId) -> EventStoreResult<Option<Envelope>> {
            Ok(self.envelopes.lock().iter().find(|e| e.id() == id).cloned())
        }

        fn read(&self, query: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
            *self.reads.lock() += 1;
            let log = self.envelopes.lock();
            let matching = log.iter().filter(|e| query.matches(e)).cloned();
            Ok(match query.order {
                Order::Ascending => matching.take(query.limit).collect(),
                Order::Descending => {
                    let all: Vec<_> = matching.collect();
                    all.into_iter().rev().take(query.limit).collect()
                }
            })
        }
    }

    fn tick(name: &'static str) -> Envelope {
        Envelope::new(
            ProducerType::try_new("clock").unwrap(),
            Id::try_new("c-1").unwrap(),
            Tick(name),
        )
    }

    fn seeded(names: &[&'static str]) -> (Log, Vec<Envelope>) {
        let log = Log::default();
        let committed = log.add(names.iter().map(|n| tick(n)).collect()).unwrap();
        (log, committed)
    }

    fn names(envelopes: &[Envelope]) -> Vec<String> {
        envelopes.iter().map(|e| e.name().to_string()).collect()
    }

    #[test]
    fn bounds_are_inclusive_or_exclusive() {
        let (log, e) = seeded(&["a", "b", "c", "d", "e"]);
        let store: &dyn EventStore = &log;
        let stream = Stream::new(store, EventFilter::all());

        assert_eq!(names(&stream.from(e[1].id()).to(e[3].id()).to_vec().unwrap()), ["b", "c", "d"]);
        assert_eq!(names(&stream.after(e[1].id()).before(e[3].id()).to_vec().unwrap()), ["c"]);
        assert!(stream.after(e[2].id()).before(e[3].id()).to_vec().unwrap().is_empty());
        assert!(stream.before(e[0].id()).to_vec().unwrap().is_empty());
    }

    #[test]
    fn later_bounds_replace_earlier_ones() {
        let (log, e) = seeded(&["a", "b", "c"]);
        let stream = log.stream(EventFilter::all()).from(e[2].id()).after(e[0].id());
        assert_eq!(names(&stream.to_vec().unwrap()), ["b", "c"]);
    }

    #[test]
    fn refinements_leave_the_receiver_untouched() {
        let (log, _) = seeded(&["a", "b", "c"]);
        let base = log.stream(EventFilter::all());
        let limited = base.limit(1);

        assert_eq!(base.to_vec().unwrap().len(), 3);
        assert_eq!(limited.to_vec().unwrap().len(), 1);
    }

    #[test]
    fn only_and_without_clear_each_other() {
        let (log, _) = seeded(&["a", "b", "a", "c"]);
        let stream = log.stream(EventFilter::all());

        let only_a = stream.only([EventName::from("a")]);
        assert_eq!(names(&only_a.to_vec().unwrap()), ["a", "a"]);

        let then_without = only_a.without([EventName::from("a")]);
        assert_eq!(then_without.names(), &NameFilter::without([EventName::from("a")]));
        assert_eq!(names(&then_without.to_vec().unwrap()), ["b", "c"]);
    }

    #[test]
    fn unknown_references_give_an_empty_stream() {
        let (log, _) = seeded(&["a"]);
        let stream = log.stream(EventFilter::all()).after(EventId::new());
        assert!(stream.to_vec().unwrap().is_empty());
        assert!(stream.first().unwrap().is_none());
        assert!(stream.last().unwrap().is_none());
    }

    #[test]
    fn first_and_last_honour_the_limit() {
        let (log, _) = seeded(&["a", "b", "c", "d"]);
        let stream = log.stream(EventFilter::all());

        assert_eq!(stream.first().unwrap().unwrap().name().as_ref(), "a");
        assert_eq!(stream.last().unwrap().unwrap().name().as_ref(), "d");
        assert_eq!(stream.limit(2).last().unwrap().unwrap().name().as_ref(), "b");
        assert!(stream.limit(0).first().unwrap().is_none());
        assert!(stream.limit(0).last().unwrap().is_none());
    }

    #[test]
    fn pages_are_fetched_lazily() {
        let (log, _) = seeded(&["a", "b", "c", "d", "e"]);
        let stream = log
            .stream(EventFilter::all())
            .with_page_size(PageSize::try_new(2).unwrap());

        let mut iter = stream.iter();
        assert!(iter.next().is_some());
        assert_eq!(*log.reads.lock(), 1);

        assert_eq!(iter.count(), 4);
        // pages of 2, 2, 1 and the empty page that ends the pass
        assert_eq!(*log.reads.lock(), 4);
    }

    #[test]
    fn writes_made_during_iteration_are_visible() {
        let (log, _) = seeded(&["a", "b"]);
        let stream = log
            .stream(EventFilter::all())
            .with_page_size(PageSize::try_new(1).unwrap());

        let mut seen = Vec::new();
        for envelope in &stream {
            let envelope = envelope.unwrap();
            if envelope.name().as_ref() == "a" {
                log.add(vec![tick("late")]).unwrap();
            }
            seen.push(envelope);
        }
        assert_eq!(names(&seen), ["a", "b", "late"]);
    }

    #[test]
    fn read_errors_end_the_iteration() {
        struct Broken;

        impl EventStore for Broken {
            fn add(&self, _: Vec<Envelope>) -> EventStoreResult<Vec<Envelope>> {
                Err(EventStoreError::EmptyBatch)
            }

            fn event(&self, _: EventId) -> EventStoreResult<Option<Envelope>> {
                Ok(None)
            }

            fn read(&self, _: &StreamQuery) -> EventStoreResult<Vec<Envelope>> {
                Err(EventStoreError::backend(std::io::Error::other("disk gone")))
            }
        }

        let store = Broken;
        let mut iter = store.stream(EventFilter::all()).iter();
        assert!(matches!(iter.next(), Some(Err(EventStoreError::Backend(_)))));
        assert!(iter.next().is_none());
    }
}
