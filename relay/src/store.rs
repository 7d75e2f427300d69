use lift_common::{event_bus::EventBus, events::Event, snapshot::StateSnapshot};
use log::*;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub snapshot: StateSnapshot,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Stored { subscribers: usize },
    Stale { current: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSummary {
    pub sequence: u64,
    pub received_at: OffsetDateTime,
    pub displays: usize,
}

#[derive(Debug)]
struct Slot {
    current: Option<StoredSnapshot>,
    bus: EventBus,
}

impl Slot {
    fn new(fop_name: &str) -> Self {
        Self {
            current: None,
            bus: EventBus::new(fop_name),
        }
    }
}

/// The latest snapshot of every field of play heard from, plus the bus its
/// displays listen on. Holds no authority of its own: whatever arrives last
/// is what gets shown.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    slots: Arc<Mutex<BTreeMap<String, Slot>>>,
    reject_stale: bool,
}

impl SnapshotStore {
    pub fn new(reject_stale: bool) -> Self {
        Self {
            slots: Arc::new(Mutex::new(BTreeMap::new())),
            reject_stale,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Displays may subscribe before anything for `fop_name` has arrived
    pub fn bus(&self, fop_name: &str) -> EventBus {
        self.lock()
            .entry(fop_name.to_string())
            .or_insert_with(|| Slot::new(fop_name))
            .bus
            .clone()
    }

    pub fn current(&self, fop_name: &str) -> Option<StoredSnapshot> {
        self.lock().get(fop_name)?.current.clone()
    }

    /// Stores and republishes under one lock, so every display sees updates in
    /// the order they were stored
    pub fn update(&self, snapshot: StateSnapshot, received_at: OffsetDateTime) -> UpdateOutcome {
        let mut slots = self.lock();
        let slot = slots
            .entry(snapshot.fop_name.clone())
            .or_insert_with(|| Slot::new(&snapshot.fop_name));

        if self.reject_stale {
            if let Some(current) = &slot.current {
                if snapshot.sequence < current.snapshot.sequence {
                    debug!(
                        "Ignoring snapshot {} of {}, already have {}",
                        snapshot.sequence, snapshot.fop_name, current.snapshot.sequence
                    );
                    return UpdateOutcome::Stale {
                        current: current.snapshot.sequence,
                    };
                }
            }
        }

        let subscribers = slot.bus.publish(Event::Snapshot {
            snapshot: Box::new(snapshot.clone()),
        });
        slot.current = Some(StoredSnapshot {
            snapshot,
            received_at,
        });
        UpdateOutcome::Stored { subscribers }
    }

    pub fn summary(&self) -> BTreeMap<String, SlotSummary> {
        self.lock()
            .iter()
            .filter_map(|(name, slot)| {
                let current = slot.current.as_ref()?;
                Some((
                    name.clone(),
                    SlotSummary {
                        sequence: current.snapshot.sequence,
                        received_at: current.received_at,
                        displays: slot.bus.subscriber_count(),
                    },
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lift_common::event_bus::SubscriptionFilter;

    fn snapshot(fop_name: &str, sequence: u64) -> StateSnapshot {
        StateSnapshot {
            fop_name: fop_name.to_string(),
            sequence,
            full_name: format!("Athlete {sequence}"),
            ..Default::default()
        }
    }

    #[test]
    fn test_last_write_wins() {
        let store = SnapshotStore::new(false);
        let now = OffsetDateTime::now_utc();
        assert_eq!(store.current("A"), None);

        store.update(snapshot("A", 5), now);
        assert_eq!(
            store.update(snapshot("A", 3), now),
            UpdateOutcome::Stored { subscribers: 0 }
        );
        assert_eq!(store.current("A").unwrap().snapshot.sequence, 3);
        assert_eq!(store.current("B"), None);
    }

    #[test]
    fn test_reject_stale() {
        let store = SnapshotStore::new(true);
        let now = OffsetDateTime::now_utc();
        store.update(snapshot("A", 5), now);
        assert_eq!(
            store.update(snapshot("A", 3), now),
            UpdateOutcome::Stale { current: 5 }
        );
        assert_eq!(store.current("A").unwrap().snapshot.sequence, 5);

        // Equal sequences are a resend, not stale
        assert!(matches!(
            store.update(snapshot("A", 5), now),
            UpdateOutcome::Stored { .. }
        ));
        assert!(matches!(
            store.update(snapshot("B", 1), now),
            UpdateOutcome::Stored { .. }
        ));
    }

    #[test]
    fn test_update_reaches_displays_of_that_platform_only() {
        let store = SnapshotStore::new(false);
        let mut a = store.bus("A").subscribe(1, SubscriptionFilter::all_topics());
        let mut b = store.bus("B").subscribe(2, SubscriptionFilter::all_topics());

        assert_eq!(
            store.update(snapshot("A", 1), OffsetDateTime::now_utc()),
            UpdateOutcome::Stored { subscribers: 1 }
        );
        match a.try_recv().as_deref() {
            Some(Event::Snapshot { snapshot }) => assert_eq!(snapshot.sequence, 1),
            other => panic!("Expected a snapshot, got {other:?}"),
        }
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_summary() {
        let store = SnapshotStore::new(false);
        let now = OffsetDateTime::now_utc();
        let _sub = store.bus("A").subscribe(1, SubscriptionFilter::all_topics());
        store.bus("C");
        store.update(snapshot("A", 7), now);
        store.update(snapshot("B", 2), now);

        let summary = store.summary();
        assert_eq!(summary.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(
            summary["A"],
            SlotSummary {
                sequence: 7,
                received_at: now,
                displays: 1,
            }
        );
        assert_eq!(summary["B"].displays, 0);
    }
}
