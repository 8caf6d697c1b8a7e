//! Event objects and per-controller listener registries.
//!
//! Dispatch walks the composed tree (the controller ancestor chain, not
//! the host tree) in three phases: capture (root to target), target,
//! then bubble (target to root, skipped when the event does not
//! bubble). The phase walk itself lives in the renderer, next to the
//! controller chain; this module owns the event value, its propagation
//! flags, and the listener records.
//!
//! Listener identity for add/remove/duplicate detection is the triple
//! (event name, callback pointer, capture flag). Re-adding an identical
//! triple is a no-op. A `once` listener deregisters itself before its
//! handler body runs, so it cannot fire twice even if the handler
//! triggers a re-dispatch.

use std::any::Any;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::Result;

// =============================================================================
// Event
// =============================================================================

bitflags! {
    /// Propagation state carried by an event while it is dispatched.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        /// The bubble phase runs after the target phase.
        const BUBBLES = 1 << 0;
        /// Cross-phase propagation has been cancelled.
        const STOPPED = 1 << 1;
        /// The current phase halts before the next listener.
        const IMMEDIATE = 1 << 2;
        /// A listener requested default-action suppression.
        const DEFAULT_PREVENTED = 1 << 3;
    }
}

/// The phase a listener observes during dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventPhase {
    None,
    Capture,
    Target,
    Bubble,
}

/// A dispatchable event.
pub struct Event {
    name: String,
    detail: Option<Rc<dyn Any>>,
    flags: EventFlags,
    phase: EventPhase,
}

impl Event {
    /// A non-bubbling event with no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detail: None,
            flags: EventFlags::empty(),
            phase: EventPhase::None,
        }
    }

    /// Enable or disable the bubble phase.
    pub fn bubbles(mut self, bubbles: bool) -> Self {
        self.flags.set(EventFlags::BUBBLES, bubbles);
        self
    }

    /// Attach an opaque payload.
    pub fn with_detail(mut self, detail: impl Any + 'static) -> Self {
        self.detail = Some(Rc::new(detail));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> EventPhase {
        self.phase
    }

    /// Downcast the payload.
    pub fn detail<T: Any>(&self) -> Option<&T> {
        self.detail.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    pub fn is_bubbling(&self) -> bool {
        self.flags.contains(EventFlags::BUBBLES)
    }

    /// Cancel cross-phase propagation; the current phase still finishes.
    pub fn stop_propagation(&mut self) {
        self.flags.insert(EventFlags::STOPPED);
    }

    /// Halt dispatch before the next listener runs.
    pub fn stop_immediate_propagation(&mut self) {
        self.flags
            .insert(EventFlags::STOPPED | EventFlags::IMMEDIATE);
    }

    pub fn prevent_default(&mut self) {
        self.flags.insert(EventFlags::DEFAULT_PREVENTED);
    }

    pub fn default_prevented(&self) -> bool {
        self.flags.contains(EventFlags::DEFAULT_PREVENTED)
    }

    pub(crate) fn propagation_stopped(&self) -> bool {
        self.flags.contains(EventFlags::STOPPED)
    }

    pub(crate) fn immediate_stopped(&self) -> bool {
        self.flags.contains(EventFlags::IMMEDIATE)
    }

    pub(crate) fn set_phase(&mut self, phase: EventPhase) {
        self.phase = phase;
    }
}

// =============================================================================
// Listener Records
// =============================================================================

/// Listener callback. Errors are reported to the diagnostic channel
/// without interrupting dispatch to the remaining listeners.
pub type ListenerFn = Rc<dyn Fn(&mut Event) -> Result<()>>;

/// Registration options for a listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Fire during the capture phase instead of target/bubble.
    pub capture: bool,
    /// Deregister before the first invocation runs.
    pub once: bool,
}

impl ListenerOptions {
    pub fn capture() -> Self {
        Self {
            capture: true,
            once: false,
        }
    }

    pub fn once() -> Self {
        Self {
            capture: false,
            once: true,
        }
    }
}

/// One registered listener.
#[derive(Clone)]
pub struct Listener {
    pub name: String,
    pub callback: ListenerFn,
    pub capture: bool,
    pub once: bool,
}

impl Listener {
    /// Identity comparison: (name, callback pointer, capture flag).
    pub fn same_registration(&self, other: &Listener) -> bool {
        self.name == other.name
            && Rc::ptr_eq(&self.callback, &other.callback)
            && self.capture == other.capture
    }
}

/// The listener registry owned by one controller.
#[derive(Default)]
pub(crate) struct ListenerSet {
    records: Vec<Listener>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Add a listener; duplicate registrations are a no-op.
    pub(crate) fn add(&mut self, listener: Listener) -> bool {
        if self.records.iter().any(|r| r.same_registration(&listener)) {
            return false;
        }

        self.records.push(listener);
        true
    }

    /// Remove by identity triple. Returns whether anything was removed.
    pub(crate) fn remove(&mut self, name: &str, callback: &ListenerFn, capture: bool) -> bool {
        let before = self.records.len();
        self.records.retain(|r| {
            !(r.name == name && Rc::ptr_eq(&r.callback, callback) && r.capture == capture)
        });
        before != self.records.len()
    }

    pub(crate) fn remove_record(&mut self, listener: &Listener) {
        self.records.retain(|r| !r.same_registration(listener));
    }

    pub(crate) fn contains(&self, listener: &Listener) -> bool {
        self.records.iter().any(|r| r.same_registration(listener))
    }

    /// Snapshot the listeners for one phase of one event.
    pub(crate) fn snapshot(&self, name: &str, capture: bool) -> Vec<Listener> {
        self.records
            .iter()
            .filter(|r| r.name == name && r.capture == capture)
            .cloned()
            .collect()
    }

    /// Snapshot every listener for the target phase, registration order.
    pub(crate) fn snapshot_all(&self, name: &str) -> Vec<Listener> {
        self.records
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ListenerFn {
        Rc::new(|_| Ok(()))
    }

    fn listener(name: &str, callback: ListenerFn, capture: bool) -> Listener {
        Listener {
            name: name.into(),
            callback,
            capture,
            once: false,
        }
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let cb = noop();
        let mut set = ListenerSet::new();
        assert!(set.add(listener("click", cb.clone(), false)));
        assert!(!set.add(listener("click", cb.clone(), false)));
        assert_eq!(set.len(), 1);

        // Same callback with the capture flag flipped is a distinct triple.
        assert!(set.add(listener("click", cb, true)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_by_triple() {
        let cb = noop();
        let other = noop();
        let mut set = ListenerSet::new();
        set.add(listener("click", cb.clone(), false));
        assert!(!set.remove("click", &other, false));
        assert!(!set.remove("click", &cb, true));
        assert!(set.remove("click", &cb, false));
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_snapshot_filters_phase() {
        let cb = noop();
        let mut set = ListenerSet::new();
        set.add(listener("click", cb.clone(), true));
        set.add(listener("click", cb.clone(), false));
        set.add(listener("keydown", cb, false));

        assert_eq!(set.snapshot("click", true).len(), 1);
        assert_eq!(set.snapshot("click", false).len(), 1);
        assert_eq!(set.snapshot_all("click").len(), 2);
        assert_eq!(set.snapshot("focus", false).len(), 0);
    }

    #[test]
    fn test_event_flag_methods() {
        let mut event = Event::new("custom").bubbles(true);
        assert!(event.is_bubbling());
        assert!(!event.propagation_stopped());

        event.stop_propagation();
        assert!(event.propagation_stopped());
        assert!(!event.immediate_stopped());

        event.stop_immediate_propagation();
        assert!(event.immediate_stopped());

        event.prevent_default();
        assert!(event.default_prevented());
    }

    #[test]
    fn test_event_detail_downcast() {
        let event = Event::new("data").with_detail(41i32);
        assert_eq!(event.detail::<i32>(), Some(&41));
        assert_eq!(event.detail::<String>(), None);
    }
}
