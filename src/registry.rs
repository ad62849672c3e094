use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;

use crate::protocol::StatusEvent;

/// Category that matches every status event.
pub const ANY_CATEGORY: &str = "*";

/// Receives status events for the categories it subscribed to.
pub trait StatusListener: Send {
    fn on_status(&mut self, event: &StatusEvent) -> Result<(), String>;
}

impl<F> StatusListener for F
where
    F: FnMut(&StatusEvent) -> Result<(), String> + Send,
{
    fn on_status(&mut self, event: &StatusEvent) -> Result<(), String> {
        self(event)
    }
}

/// Forwards events into a channel; fails once the receiver is gone.
impl StatusListener for mpsc::UnboundedSender<StatusEvent> {
    fn on_status(&mut self, event: &StatusEvent) -> Result<(), String> {
        self.send(event.clone())
            .map_err(|_| "status receiver dropped".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Listener that errored or panicked during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub handle: SubscriptionHandle,
    pub category: String,
    pub error: String,
}

struct Entry {
    handle: SubscriptionHandle,
    category: String,
    listener: Box<dyn StatusListener>,
}

/// Status category to listener bindings.
///
/// # Guarantees
/// * Listeners run in subscription order.
/// * A failing listener never stops delivery to the rest; its failure is
///   returned to the caller of [`dispatch`](Self::dispatch).
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("listeners", &self.entries.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        category: impl Into<String>,
        listener: Box<dyn StatusListener>,
    ) -> SubscriptionHandle {
        self.next_id += 1;
        let handle = SubscriptionHandle(self.next_id);
        self.entries.push(Entry {
            handle,
            category: category.into(),
            listener,
        });
        handle
    }

    /// Returns `false` when the handle was not subscribed.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        self.entries.len() != before
    }

    pub fn dispatch(&mut self, event: &StatusEvent) -> Vec<ListenerFailure> {
        let mut failures = Vec::new();
        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| matches_category(&entry.category, &event.category))
        {
            let listener = &mut entry.listener;
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_status(event)))
                .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));
            if let Err(error) = result {
                failures.push(ListenerFailure {
                    handle: entry.handle,
                    category: event.category.clone(),
                    error,
                });
            }
        }
        failures
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn matches_category(subscribed: &str, category: &str) -> bool {
    subscribed == ANY_CATEGORY || subscribed.eq_ignore_ascii_case(category)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("listener panicked: {text}")
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn event(category: &str) -> StatusEvent {
        StatusEvent {
            category: category.into(),
            handle: None,
            pairs: vec![("k".into(), "v".into())],
            raw: "k=v".into(),
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Box<dyn StatusListener> {
        let log = log.clone();
        let tag = tag.to_string();
        Box::new(move |event: &StatusEvent| -> Result<(), String> {
            log.lock().push(format!("{tag}:{}", event.category));
            Ok(())
        })
    }

    #[test]
    fn dispatches_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("slice", recorder(&log, "a"));
        registry.subscribe("radio", recorder(&log, "x"));
        registry.subscribe("slice", recorder(&log, "b"));
        registry.subscribe(ANY_CATEGORY, recorder(&log, "any"));

        assert!(registry.dispatch(&event("slice")).is_empty());
        assert_eq!(*log.lock(), vec!["a:slice", "b:slice", "any:slice"]);
    }

    #[test]
    fn failing_listeners_do_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        let failing = registry.subscribe(
            "meter",
            Box::new(|_: &StatusEvent| -> Result<(), String> { Err("boom".to_string()) }),
        );
        let panicking = registry.subscribe(
            "meter",
            Box::new(|_: &StatusEvent| -> Result<(), String> { panic!("kaboom") }),
        );
        registry.subscribe("meter", recorder(&log, "ok"));

        let failures = registry.dispatch(&event("meter"));
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].handle, failing);
        assert_eq!(failures[0].error, "boom");
        assert_eq!(failures[1].handle, panicking);
        assert!(failures[1].error.contains("kaboom"));
        assert_eq!(*log.lock(), vec!["ok:meter"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        let first = registry.subscribe("gps", recorder(&log, "first"));
        registry.subscribe("gps", recorder(&log, "second"));

        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        registry.dispatch(&event("gps"));
        assert_eq!(*log.lock(), vec!["second:gps"]);
    }

    #[test]
    fn category_match_ignores_ascii_case() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("Slice", recorder(&log, "s"));
        registry.dispatch(&event("slice"));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn channel_listener_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("radio", Box::new(tx));
        assert!(registry.dispatch(&event("radio")).is_empty());
        drop(rx);
        assert_eq!(registry.dispatch(&event("radio")).len(), 1);
    }

    #[test]
    fn clear_drops_all_bindings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("radio", recorder(&log, "r"));
        registry.clear();
        assert!(registry.is_empty());
        registry.dispatch(&event("radio"));
        assert!(log.lock().is_empty());
    }
}
