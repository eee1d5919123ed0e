use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

pub type EventFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Fan-out of one session feed to any number of subscribers.
///
/// Every subscriber owns a bounded queue. Publishing never waits: a full queue
/// drops the newest event for that subscriber only. A bounded history backs
/// tail requests and subscription backlogs.
pub struct EventHub<T> {
    shared: Arc<Mutex<HubState<T>>>,
    capacity: usize,
    history_limit: usize,
}

struct HubState<T> {
    next_seq: u64,
    next_subscriber: u64,
    history: VecDeque<T>,
    subscribers: Vec<Subscriber<T>>,
    closed: bool,
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    filter: Option<EventFilter<T>>,
    dropped: u64,
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new(capacity: usize, history_limit: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(HubState {
                next_seq: 1,
                next_subscriber: 0,
                history: VecDeque::new(),
                subscribers: Vec::new(),
                closed: false,
            })),
            capacity: capacity.max(1),
            history_limit,
        }
    }

    /// Builds the next event from its sequence number and fans it out.
    /// Returns `None` once the hub is closed.
    pub fn publish(&self, make: impl FnOnce(u64) -> T) -> Option<u64> {
        let mut state = self.shared.lock();
        if state.closed {
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let event = make(seq);

        state.subscribers.retain_mut(|subscriber| {
            if let Some(filter) = &subscriber.filter {
                if !filter(&event) {
                    return true;
                }
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.dropped += 1;
                    debug!(
                        subscriber = subscriber.id,
                        dropped = subscriber.dropped,
                        seq,
                        "subscriber queue full; dropping event"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if self.history_limit > 0 {
            if state.history.len() == self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(event);
        }
        Some(seq)
    }

    /// Backlog of up to `backlog` recent events plus live registration, taken
    /// under one lock so nothing falls between the two.
    pub fn subscribe(&self, backlog: usize, filter: Option<EventFilter<T>>) -> Subscription<T> {
        let mut state = self.shared.lock();
        let backlog = recent(&state.history, backlog, filter.as_ref());
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        if !state.closed {
            state.subscribers.push(Subscriber {
                id,
                tx,
                filter,
                dropped: 0,
            });
        }
        Subscription {
            id,
            backlog: backlog.into(),
            rx,
            hub: Arc::downgrade(&self.shared),
        }
    }

    /// Most recent `limit` events matching `filter`, oldest first.
    pub fn recent(&self, limit: usize, filter: Option<&EventFilter<T>>) -> Vec<T> {
        let state = self.shared.lock();
        recent(&state.history, limit, filter)
    }

    /// Ends every live subscription once its queued events are drained.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }
}

fn recent<T: Clone>(
    history: &VecDeque<T>,
    limit: usize,
    filter: Option<&EventFilter<T>>,
) -> Vec<T> {
    if limit == 0 {
        return Vec::new();
    }
    let mut selected: Vec<T> = history
        .iter()
        .rev()
        .filter(|event| filter.map_or(true, |filter| filter(event)))
        .take(limit)
        .cloned()
        .collect();
    selected.reverse();
    selected
}

/// Live view of a hub. Dropping it unregisters the subscriber.
pub struct Subscription<T> {
    id: u64,
    backlog: VecDeque<T>,
    rx: mpsc::Receiver<T>,
    hub: Weak<Mutex<HubState<T>>>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }
}

impl<T: Unpin> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(event) = this.backlog.pop_front() {
            return Poll::Ready(Some(event));
        }
        this.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            let id = self.id;
            hub.lock().subscribers.retain(|subscriber| subscriber.id != id);
        }
    }
}
