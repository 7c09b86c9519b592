use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    sync::mpsc::Sender,
};
use tokio::sync::{broadcast, mpsc::UnboundedSender};

use crate::{error::ArborError, properties::ChangeReason};

/// Published once per change reason per save: the cached variants of `trees` were
/// invalidated (or, for `ElementCounts`, their counts must be re-resolved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeChangeEvent {
    pub reason: ChangeReason,
    pub trees: BTreeSet<String>,
}

impl Display for TreeChangeEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let trees = self.trees.iter().cloned().collect::<Vec<_>>().join(", ");
        write!(f, "{} [{}]", self.reason, trees)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[default]
    Ping,
    TreeChanged(TreeChangeEvent),
}

/// Sink for change events. The core only needs fire-and-forget publication.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event) -> Result<(), ArborError>;
}

impl EventBus for Sender<Event> {
    fn publish(&self, event: Event) -> Result<(), ArborError> {
        Ok(self.send(event)?)
    }
}

impl EventBus for UnboundedSender<Event> {
    fn publish(&self, event: Event) -> Result<(), ArborError> {
        Ok(self.send(event)?)
    }
}

impl EventBus for broadcast::Sender<Event> {
    fn publish(&self, event: Event) -> Result<(), ArborError> {
        self.send(event)?;
        Ok(())
    }
}

/// Per-save bookkeeping: which `(tree, reason)` pairs were already acted on and which
/// reasons were already announced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingInvalidation {
    handled: BTreeSet<(String, ChangeReason)>,
    notified: BTreeSet<ChangeReason>,
    queued: BTreeMap<ChangeReason, BTreeSet<String>>,
}

impl PendingInvalidation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the pair was already handled in this save.
    pub fn mark_handled(&mut self, tree: &str, reason: ChangeReason) -> bool {
        self.handled.insert((tree.to_string(), reason))
    }

    pub fn is_notified(&self, reason: ChangeReason) -> bool {
        self.notified.contains(&reason)
    }

    /// Record that `tree` is affected by `reason`, to be announced by
    /// [`ChangeNotifier::flush`].
    pub fn queue(&mut self, reason: ChangeReason, tree: &str) {
        self.queued.entry(reason).or_default().insert(tree.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier<E> {
    bus: E,
}

impl<E: EventBus> ChangeNotifier<E> {
    pub fn new(bus: E) -> Self {
        ChangeNotifier { bus }
    }

    /// Publish `reason` for `trees` unless it was already published in this save. Returns
    /// whether an event went out. Publication failures are logged, not propagated.
    pub fn publish(
        &self,
        pending: &mut PendingInvalidation,
        reason: ChangeReason,
        trees: BTreeSet<String>,
    ) -> bool {
        if pending.notified.contains(&reason) {
            return false;
        }
        pending.notified.insert(reason);
        let event = TreeChangeEvent { reason, trees };
        tracing::debug!("Publishing tree change: {}", event);
        match self.bus.publish(Event::TreeChanged(event)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Tree change notification for {} dropped: {}", reason, e);
                false
            }
        }
    }

    /// Publish every queued reason, in processing order. Returns the published reasons.
    pub fn flush(&self, pending: &mut PendingInvalidation) -> Vec<ChangeReason> {
        let queued = std::mem::take(&mut pending.queued);
        queued
            .into_iter()
            .filter_map(|(reason, trees)| self.publish(pending, reason, trees).then_some(reason))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn each_reason_is_published_once() {
        let (tx, mut rx) = unbounded_channel();
        let notifier = ChangeNotifier::new(tx);
        let mut pending = PendingInvalidation::new();
        for _ in 0..10 {
            pending.queue(ChangeReason::Hierarchy, "main");
        }
        pending.queue(ChangeReason::Data, "footer");

        let published = notifier.flush(&mut pending);
        assert_eq!(published, vec![ChangeReason::Hierarchy, ChangeReason::Data]);
        assert!(!notifier.publish(
            &mut pending,
            ChangeReason::Hierarchy,
            BTreeSet::from(["main".to_string()])
        ));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            Event::TreeChanged(TreeChangeEvent {
                reason: ChangeReason::Hierarchy,
                trees: BTreeSet::from(["main".to_string()]),
            })
        );
    }

    #[test]
    fn closed_bus_does_not_fail_the_save() {
        let (tx, rx) = std::sync::mpsc::channel();
        drop(rx);
        let notifier = ChangeNotifier::new(tx);
        let mut pending = PendingInvalidation::new();
        assert!(!notifier.publish(&mut pending, ChangeReason::Acl, BTreeSet::new()));
        assert!(pending.is_notified(ChangeReason::Acl));
    }
}
