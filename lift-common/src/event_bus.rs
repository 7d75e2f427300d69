use crate::events::{Event, Topic};
use log::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SessionId = u64;

const SUBSCRIBER_QUEUE_LEN: usize = 64;

/// Which events a session wants. Events aimed at a single referee are only
/// delivered when `referee` matches, regardless of topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub topics: BTreeSet<Topic>,
    pub referee: Option<u8>,
}

impl SubscriptionFilter {
    pub fn all_topics() -> Self {
        Self {
            topics: Topic::all().collect(),
            referee: None,
        }
    }

    pub fn topics<I: IntoIterator<Item = Topic>>(topics: I) -> Self {
        Self {
            topics: topics.into_iter().collect(),
            referee: None,
        }
    }

    pub fn with_referee(mut self, referee: u8) -> Self {
        self.referee = Some(referee);
        self
    }

    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(target) = event.target_referee() {
            if self.referee != Some(target) {
                return false;
            }
        }
        self.topics.contains(&event.topic())
    }
}

#[derive(Debug)]
struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Arc<Event>>,
    active: Arc<AtomicBool>,
}

#[derive(Debug)]
struct BusInner {
    name: String,
    subscribers: BTreeMap<SessionId, Subscriber>,
}

/// In-process fan-out of events for one field of play. Each subscriber gets its
/// own queue, so a subscriber sees events in exactly the order they were published.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                name: name.to_string(),
                subscribers: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_subscribed(&self, id: SessionId) -> bool {
        self.lock().subscribers.contains_key(&id)
    }

    /// Registers `id`, replacing any earlier subscription under the same id
    pub fn subscribe(&self, id: SessionId, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_LEN);
        let active = Arc::new(AtomicBool::new(true));

        let mut inner = self.lock();
        debug!("Bus {}: subscribing session {id} to {filter:?}", inner.name);
        if let Some(old) = inner.subscribers.insert(
            id,
            Subscriber {
                filter,
                tx,
                active: active.clone(),
            },
        ) {
            old.active.store(false, Ordering::SeqCst);
        }

        Subscription { id, rx, active }
    }

    /// Returns `false` if the session was not subscribed. Calling this twice is fine.
    pub fn unsubscribe(&self, id: SessionId) -> bool {
        let mut inner = self.lock();
        match inner.subscribers.remove(&id) {
            Some(sub) => {
                sub.active.store(false, Ordering::SeqCst);
                debug!("Bus {}: unsubscribed session {id}", inner.name);
                true
            }
            None => false,
        }
    }

    /// Queues `event` for every matching subscriber and returns how many got it
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut inner = self.lock();
        trace!("Bus {}: publishing {:?}", inner.name, event.topic());

        let mut delivered = 0;
        let mut to_drop = vec![];
        for (id, sub) in inner
            .subscribers
            .iter()
            .filter(|(_, sub)| sub.filter.accepts(&event))
        {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Session {id} is not keeping up, dropping {:?}", event.topic());
                }
                Err(TrySendError::Closed(_)) => {
                    info!("Session {id} queue closed");
                    to_drop.push(*id);
                }
            }
        }
        for id in to_drop {
            if let Some(sub) = inner.subscribers.remove(&id) {
                sub.active.store(false, Ordering::SeqCst);
            }
        }

        delivered
    }
}

/// The receiving end of a bus subscription. Once the session is unsubscribed,
/// anything still queued is discarded.
#[derive(Debug)]
pub struct Subscription {
    id: SessionId,
    rx: mpsc::Receiver<Arc<Event>>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        let event = self.rx.recv().await?;
        if self.is_active() {
            Some(event)
        } else {
            self.rx.close();
            None
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        let event = self.rx.try_recv().ok()?;
        if self.is_active() { Some(event) } else { None }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events::{ClockKind, SummonPhase};

    fn drain(sub: &mut Subscription) -> Vec<Event> {
        let mut events = vec![];
        while let Some(event) = sub.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    #[test]
    fn test_ordered_per_subscriber() {
        let bus = EventBus::new("A");
        let mut sub = bus.subscribe(1, SubscriptionFilter::all_topics());

        let published = vec![
            Event::StartTime { remaining_ms: 60_000 },
            Event::DownSignal,
            Event::StopTime {
                kind: ClockKind::Attempt,
                remaining_ms: 51_000,
            },
            Event::DecisionReset,
            Event::GlobalRankingUpdated,
        ];
        for event in published.iter().cloned() {
            assert_eq!(bus.publish(event), 1);
        }

        assert_eq!(drain(&mut sub), published);
    }

    #[test]
    fn test_topic_filter() {
        let bus = EventBus::new("A");
        let mut decisions = bus.subscribe(1, SubscriptionFilter::topics([Topic::DownSignal]));
        let mut everything = bus.subscribe(2, SubscriptionFilter::all_topics());

        bus.publish(Event::StartLifting);
        bus.publish(Event::DownSignal);

        assert_eq!(drain(&mut decisions), vec![Event::DownSignal]);
        assert_eq!(
            drain(&mut everything),
            vec![Event::StartLifting, Event::DownSignal]
        );
    }

    #[test]
    fn test_targeted_events_only_reach_that_referee() {
        let bus = EventBus::new("A");
        let mut ref1 = bus.subscribe(1, SubscriptionFilter::all_topics().with_referee(1));
        let mut ref2 = bus.subscribe(2, SubscriptionFilter::all_topics().with_referee(2));
        let mut scoreboard = bus.subscribe(3, SubscriptionFilter::all_topics());

        let summon = Event::SummonRef {
            referee: 2,
            phase: SummonPhase::Alert,
        };
        assert_eq!(bus.publish(summon.clone()), 1);

        assert!(drain(&mut ref1).is_empty());
        assert!(drain(&mut scoreboard).is_empty());
        assert_eq!(drain(&mut ref2), vec![summon]);
    }

    #[test]
    fn test_unsubscribe_discards_queued_events() {
        let bus = EventBus::new("A");
        let mut sub = bus.subscribe(9, SubscriptionFilter::all_topics());

        bus.publish(Event::DownSignal);
        assert!(bus.unsubscribe(9));
        assert!(!bus.unsubscribe(9));
        assert_eq!(bus.publish(Event::DecisionReset), 0);

        assert!(sub.try_recv().is_none());
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_resubscribe_replaces_old_subscription() {
        let bus = EventBus::new("A");
        let mut old = bus.subscribe(4, SubscriptionFilter::all_topics());
        let mut new = bus.subscribe(4, SubscriptionFilter::all_topics());

        bus.publish(Event::StartLifting);
        assert!(old.try_recv().is_none());
        assert_eq!(drain(&mut new), vec![Event::StartLifting]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_subscriber_removed() {
        let bus = EventBus::new("A");
        let sub = bus.subscribe(5, SubscriptionFilter::all_topics());
        drop(sub);

        assert_eq!(bus.publish(Event::GlobalRankingUpdated), 0);
        assert!(!bus.is_subscribed(5));
    }

    #[test]
    fn test_full_queue_drops_events() {
        let bus = EventBus::new("A");
        let mut sub = bus.subscribe(6, SubscriptionFilter::all_topics());

        for _ in 0..SUBSCRIBER_QUEUE_LEN {
            assert_eq!(bus.publish(Event::DownSignal), 1);
        }
        assert_eq!(bus.publish(Event::DecisionReset), 0);
        assert!(bus.is_subscribed(6));

        let events = drain(&mut sub);
        assert_eq!(events.len(), SUBSCRIBER_QUEUE_LEN);
        assert!(events.iter().all(|e| *e == Event::DownSignal));
    }

    #[tokio::test]
    async fn test_async_recv() {
        let bus = EventBus::new("A");
        let mut sub = bus.subscribe(7, SubscriptionFilter::all_topics());

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(Event::StartLifting);
            publisher.publish(Event::GlobalRankingUpdated);
        });

        assert_eq!(*sub.recv().await.unwrap(), Event::StartLifting);
        assert_eq!(*sub.recv().await.unwrap(), Event::GlobalRankingUpdated);
    }
}
