//! Component controller - the runtime driver for one mounted component.
//!
//! A [`Ctrl`] is allocated when an element with a component tag mounts
//! and destroyed when that element unmounts. It owns the body instance,
//! the execution state machine, the provision map, the listener
//! registry, and the schedule/cleanup callback sets. The [`Context`]
//! handle is the surface the component body sees.
//!
//! # Scheduling
//!
//! `refresh` (component-initiated) and `update` (parent-initiated) both
//! funnel into `run`, which enforces at most one step in flight per
//! controller:
//!
//! - no step in flight: start one immediately.
//! - step in flight, async-generator body: the newest props are
//!   buffered (`available`) and the in-flight result stands. Async
//!   generators are never stepped concurrently.
//! - step in flight, any other body: coalesce to exactly one enqueued
//!   follow-up. An earlier enqueued-but-not-started request is
//!   discarded, and when the in-flight step settles its child value is
//!   dropped in favor of the follow-up, so only the newest update's
//!   result is ever committed.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;
use tracing::{debug, error};

use crate::adapter::{HostAdapter, Value};
use crate::component::{Body, BodyKind, ComponentSpec, Flow, Resumption};
use crate::element::Props;
use crate::error::{RenderError, Result};
use crate::events::{Event, EventPhase, Listener, ListenerFn, ListenerOptions, ListenerSet};
use crate::renderer::{self, Core, NodeId, Outcome, RTag};

// =============================================================================
// Execution State
// =============================================================================

/// Where the body is in its step cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// The body has never been stepped.
    Fresh,
    /// Inside the body's synchronous execution (reentrancy guard).
    Stepping,
    /// Between steps.
    Settled,
}

/// Whether the controller still accepts work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Life {
    Mounted,
    /// The body signaled completion; its last value stays rendered.
    Finished,
    /// Terminal. No further work is accepted.
    Unmounted,
}

type ValueCallback<A> = Box<dyn FnOnce(Value<<A as HostAdapter>::Node>)>;

/// One controller per mounted component element.
pub(crate) struct Ctrl<A: HostAdapter> {
    pub(crate) spec: Rc<ComponentSpec<A>>,
    pub(crate) kind: BodyKind,
    /// Identity chain for provision lookup and event propagation.
    pub(crate) parent_ctrl: Option<NodeId>,
    /// Nearest host/portal ancestor; the component's flattened output is
    /// arranged under this element's host value.
    pub(crate) arranger: NodeId,
    pub(crate) phase: Phase,
    pub(crate) life: Life,
    /// Set while the body pulls props; cleared when it yields. Guards
    /// against pulling twice without an intervening yield.
    pub(crate) iterating: bool,
    /// Buffered rerun request for an async generator stepped mid-flight.
    pub(crate) available: bool,
    /// Exactly one coalesced follow-up step, at most.
    pub(crate) enqueued: bool,
    pub(crate) inflight: bool,
    /// True while a parent-initiated update owns the commit; a commit
    /// outside an update cycle re-arranges the arranger itself.
    pub(crate) updating: bool,
    /// The body instance; taken out while user code runs so the body
    /// may re-enter the engine through its `Context`.
    pub(crate) body: Option<Body<A>>,
    pub(crate) provisions: HashMap<String, Rc<dyn Any>>,
    pub(crate) listeners: ListenerSet,
    pub(crate) schedule_cbs: Vec<ValueCallback<A>>,
    pub(crate) cleanup_cbs: Vec<ValueCallback<A>>,
}

impl<A: HostAdapter> Ctrl<A> {
    pub(crate) fn new(
        spec: Rc<ComponentSpec<A>>,
        parent_ctrl: Option<NodeId>,
        arranger: NodeId,
    ) -> Self {
        let kind = spec.kind();
        let body = spec.instantiate();
        Self {
            spec,
            kind,
            parent_ctrl,
            arranger,
            phase: Phase::Fresh,
            life: Life::Mounted,
            iterating: false,
            available: false,
            enqueued: false,
            inflight: false,
            updating: false,
            body: Some(body),
            provisions: HashMap::new(),
            listeners: ListenerSet::new(),
            schedule_cbs: Vec::new(),
            cleanup_cbs: Vec::new(),
        }
    }
}

// =============================================================================
// Update Pipeline
// =============================================================================

/// Parent-initiated update. New props were already written to the
/// retained node by the diff.
pub(crate) fn ctrl_update<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
) -> Result<Outcome> {
    {
        let mut c = core.borrow_mut();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return Ok(Outcome::Ready);
        };
        match ctrl.life {
            Life::Unmounted => {
                debug!(component = ctrl.spec.name(), "update on unmounted controller ignored");
                return Ok(Outcome::Ready);
            }
            // A finished body keeps its last value; props changes are moot.
            Life::Finished => return Ok(Outcome::Ready),
            Life::Mounted => {}
        }
        ctrl.updating = true;
    }

    run(core, id)
}

/// Component-initiated refresh.
pub(crate) fn ctrl_refresh<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
) -> Result<Outcome> {
    {
        let mut c = core.borrow_mut();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return Ok(Outcome::Ready);
        };
        match ctrl.life {
            Life::Unmounted => {
                debug!(component = ctrl.spec.name(), "refresh on unmounted controller ignored");
                return Ok(Outcome::Ready);
            }
            Life::Finished => return Ok(Outcome::Ready),
            Life::Mounted => {}
        }
        if ctrl.phase == Phase::Stepping {
            // Refresh from inside the body; run again once this step ends.
            ctrl.enqueued = true;
            return Ok(Outcome::Pending);
        }
    }

    run(core, id)
}

/// Enforce the one-in-flight / one-enqueued pipeline, then step.
fn run<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, id: NodeId) -> Result<Outcome> {
    {
        let mut c = core.borrow_mut();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return Ok(Outcome::Ready);
        };
        if ctrl.inflight {
            if ctrl.kind == BodyKind::AsyncGenerator {
                ctrl.available = true;
            } else {
                ctrl.enqueued = true;
            }
            return Ok(Outcome::Pending);
        }
    }

    step(core, id)
}

/// Invoke the body once (or resume its driver once).
fn step<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, id: NodeId) -> Result<Outcome> {
    let (body, props, ctx) = {
        let mut c = core.borrow_mut();
        let weak = c.self_weak.clone();
        let Some(node) = c.nodes.get(id) else {
            return Ok(Outcome::Ready);
        };
        let props = node.props.clone();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return Ok(Outcome::Ready);
        };
        if ctrl.life == Life::Unmounted {
            return Ok(Outcome::Ready);
        }
        let Some(body) = ctrl.body.take() else {
            return Err(RenderError::Protocol(format!(
                "component {} resumed while already stepping",
                ctrl.spec.name()
            )));
        };
        ctrl.phase = Phase::Stepping;
        ctrl.inflight = true;
        (body, props, Context::new(weak, id))
    };

    match body {
        Body::Function(f) => {
            let result = f(ctx, &props).map(Flow::Continue);
            settle_sync(core, id, Body::Function(f), result)
        }
        Body::Generator(mut driver) => {
            let result = driver.resume(ctx, Resumption::Props(props));
            settle_sync(core, id, Body::Generator(driver), result)
        }
        Body::AsyncFunction(f) => {
            let fut = f(ctx, props);
            restore_after_call(core, id, Body::AsyncFunction(f));
            spawn_step(core, id, Box::pin(async move { fut.await.map(Flow::Continue) }));
            Ok(Outcome::Pending)
        }
        Body::AsyncGenerator(mut driver) => {
            let fut = driver.resume(ctx, Resumption::Props(props));
            restore_after_call(core, id, Body::AsyncGenerator(driver));
            spawn_step(core, id, fut);
            Ok(Outcome::Pending)
        }
    }
}

/// Put the body back and leave the synchronous window.
fn restore_after_call<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, id: NodeId, body: Body<A>) {
    let mut c = core.borrow_mut();
    if let Some(ctrl) = c.ctrl_mut(id) {
        ctrl.body = Some(body);
        ctrl.phase = Phase::Settled;
        ctrl.iterating = false;
    }
}

fn settle_sync<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    body: Body<A>,
    result: Result<Flow<A>>,
) -> Result<Outcome> {
    restore_after_call(core, id, body);
    match result {
        Ok(flow) => apply_flow(core, id, flow),
        Err(err) => {
            // The body itself threw; propagate to the update/refresh caller.
            clear_inflight(core, id);
            Err(err)
        }
    }
}

/// Hand a yielded child to the renderer under this controller.
fn apply_flow<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    flow: Flow<A>,
) -> Result<Outcome> {
    if flow.is_complete() {
        let mut c = core.borrow_mut();
        if let Some(ctrl) = c.ctrl_mut(id)
            && ctrl.life == Life::Mounted
        {
            ctrl.life = Life::Finished;
        }
    }

    let child = flow.child();
    match renderer::update_component_children(core, id, child) {
        Ok(outcome) => Ok(outcome),
        Err(err) => try_inject(core, id, err),
    }
}

/// Redirect a child-commit error back into a generator that declared
/// the catch capability; otherwise propagate it.
fn try_inject<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    err: RenderError,
) -> Result<Outcome> {
    let (can_catch, ctx) = {
        let mut c = core.borrow_mut();
        let weak = c.self_weak.clone();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return Err(err);
        };
        let can = ctrl.life == Life::Mounted
            && ctrl.body.as_ref().is_some_and(|b| b.handles_errors());
        (can, Context::new(weak, id))
    };

    if !can_catch {
        clear_inflight(core, id);
        return Err(err);
    }

    let body = {
        let mut c = core.borrow_mut();
        c.ctrl_mut(id).and_then(|ctrl| ctrl.body.take())
    };
    match body {
        Some(Body::Generator(mut driver)) => {
            let result = driver.resume(ctx, Resumption::Error(err));
            restore_after_call(core, id, Body::Generator(driver));
            match result {
                Ok(flow) => apply_flow(core, id, flow),
                Err(rethrown) => {
                    clear_inflight(core, id);
                    Err(rethrown)
                }
            }
        }
        Some(Body::AsyncGenerator(mut driver)) => {
            let fut = driver.resume(ctx, Resumption::Error(err));
            restore_after_call(core, id, Body::AsyncGenerator(driver));
            spawn_step(core, id, fut);
            Ok(Outcome::Pending)
        }
        Some(other) => {
            restore_after_call(core, id, other);
            clear_inflight(core, id);
            Err(RenderError::Protocol(
                "error injection on a non-generator body".into(),
            ))
        }
        None => {
            clear_inflight(core, id);
            Err(RenderError::Protocol(
                "error injection while body is stepping".into(),
            ))
        }
    }
}

fn clear_inflight<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, id: NodeId) {
    let mut c = core.borrow_mut();
    if let Some(ctrl) = c.ctrl_mut(id) {
        ctrl.inflight = false;
    }
}

/// Drive an asynchronous resumption on the cooperative queue.
fn spawn_step<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    fut: LocalBoxFuture<'static, Result<Flow<A>>>,
) {
    let rc = core.clone();
    let task = async move {
        let result = fut.await;
        finish_async_step(&rc, id, result);
        renderer::flush_deferred(&rc);
    };
    renderer::spawn(core, task);
}

/// Completion path for an asynchronous step.
fn finish_async_step<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    result: Result<Flow<A>>,
) {
    {
        let mut c = core.borrow_mut();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return;
        };
        if ctrl.life == Life::Unmounted {
            ctrl.inflight = false;
            return;
        }
        if ctrl.enqueued && ctrl.kind != BodyKind::AsyncGenerator {
            // A newer update was coalesced behind this step: its props
            // win and this step's child value is never committed.
            ctrl.enqueued = false;
            ctrl.inflight = false;
            drop(c);
            if let Err(err) = step(core, id) {
                renderer::record_error(core, err);
            }
            return;
        }
    }

    let outcome = match result {
        Ok(flow) => apply_flow(core, id, flow),
        Err(err) => try_inject(core, id, err),
    };
    if let Err(err) = outcome {
        renderer::record_error(core, err);
    }
}

/// Commit hook: run the coalesced follow-up (or the buffered async-gen
/// rerun) once the previous step has fully settled.
pub(crate) fn ctrl_follow_up<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, id: NodeId) {
    let go = {
        let mut c = core.borrow_mut();
        let Some(ctrl) = c.ctrl_mut(id) else {
            return;
        };
        if ctrl.inflight || ctrl.life != Life::Mounted {
            false
        } else if ctrl.enqueued {
            ctrl.enqueued = false;
            true
        } else if ctrl.available {
            ctrl.available = false;
            true
        } else {
            false
        }
    };

    if go && let Err(err) = step(core, id) {
        renderer::record_error(core, err);
    }
}

// =============================================================================
// Unmount
// =============================================================================

/// Destroy a controller: mark unmounted, clear listeners, finalize the
/// body (gracefully, possibly asynchronously), then unmount children,
/// fire cleanup callbacks with the last committed value, and release
/// the retained node.
pub(crate) fn ctrl_unmount<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    root_level: bool,
) -> Result<()> {
    let (finalize, graveyard, ctx) = {
        let mut c = core.borrow_mut();
        let weak = c.self_weak.clone();
        let Some(node) = c.nodes.get_mut(id) else {
            return Ok(());
        };
        let graveyard = node
            .pending
            .take()
            .map(|p| p.graveyard)
            .unwrap_or_default();
        let RTag::Component(ctrl) = &mut node.tag else {
            return Ok(());
        };
        if ctrl.life == Life::Unmounted {
            return Ok(());
        }
        let finished = ctrl.life == Life::Finished;
        ctrl.life = Life::Unmounted;
        ctrl.listeners.clear();
        let finalize = if ctrl.phase != Phase::Fresh && !finished {
            ctrl.body.take()
        } else {
            None
        };
        (finalize, graveyard, Context::new(weak, id))
    };

    for dead in graveyard {
        renderer::unmount(core, dead, false)?;
    }

    match finalize {
        Some(Body::Generator(mut driver)) => {
            let result = driver.resume(ctx, Resumption::Finish);
            let violation = match result {
                Ok(Flow::Continue(_)) => Some(RenderError::Protocol(format!(
                    "generator {} yielded after being asked to finish",
                    spec_name(core, id)
                ))),
                Ok(Flow::Complete(_)) => None,
                Err(err) => Some(err),
            };
            finish_unmount(core, id, root_level)?;
            match violation {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
        Some(Body::AsyncGenerator(mut driver)) => {
            // Finalization is allowed one last asynchronous step; the
            // children come down once it resolves.
            let fut = driver.resume(ctx, Resumption::Finish);
            let rc = core.clone();
            renderer::spawn(core, async move {
                match fut.await {
                    Ok(Flow::Continue(_)) => renderer::record_error(
                        &rc,
                        RenderError::Protocol(format!(
                            "generator {} yielded after being asked to finish",
                            spec_name(&rc, id)
                        )),
                    ),
                    Ok(Flow::Complete(_)) => {}
                    Err(err) => renderer::record_error(&rc, err),
                }
                if let Err(err) = finish_unmount(&rc, id, root_level) {
                    renderer::record_error(&rc, err);
                }
                renderer::flush_deferred(&rc);
            });
            Ok(())
        }
        // Plain function bodies have nothing to finalize.
        _ => finish_unmount(core, id, root_level),
    }
}

/// Second half of controller unmount: children, cleanups, release.
fn finish_unmount<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    root_level: bool,
) -> Result<()> {
    let (children, cleanups, last_value) = {
        let mut c = core.borrow_mut();
        let Some(node) = c.nodes.get_mut(id) else {
            return Ok(());
        };
        let children = renderer::child_node_ids(&node.children);
        let value = node.value.clone();
        let cleanups = match &mut node.tag {
            RTag::Component(ctrl) => std::mem::take(&mut ctrl.cleanup_cbs),
            _ => Vec::new(),
        };
        let value = c.adapter.read(&value);
        (children, cleanups, value)
    };

    for child in children {
        renderer::unmount(core, child, root_level)?;
    }

    if !cleanups.is_empty() {
        let mut c = core.borrow_mut();
        for cb in cleanups {
            let value = last_value.clone();
            c.deferred.push_back(Box::new(move || cb(value)));
        }
    }

    core.borrow_mut().nodes.remove(id);
    Ok(())
}

fn spec_name<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, id: NodeId) -> String {
    core.borrow()
        .ctrl(id)
        .map(|ctrl| ctrl.spec.name().to_string())
        .unwrap_or_else(|| "<unmounted>".to_string())
}

// =============================================================================
// Event Dispatch
// =============================================================================

/// Capture/target/bubble dispatch across the composed tree.
pub(crate) fn dispatch<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    target: NodeId,
    mut event: Event,
) -> Result<bool> {
    // Ancestor chain, target side first.
    let path_up = {
        let c = core.borrow();
        let mut path = Vec::new();
        let mut cursor = c.ctrl(target).and_then(|ctrl| ctrl.parent_ctrl);
        while let Some(ancestor) = cursor {
            cursor = c.ctrl(ancestor).and_then(|ctrl| ctrl.parent_ctrl);
            path.push(ancestor);
        }
        path
    };

    for &ancestor in path_up.iter().rev() {
        run_phase(core, ancestor, &mut event, EventPhase::Capture);
        if event.propagation_stopped() {
            break;
        }
    }

    if !event.propagation_stopped() {
        run_phase(core, target, &mut event, EventPhase::Target);
    }

    if event.is_bubbling() && !event.propagation_stopped() {
        for &ancestor in path_up.iter() {
            run_phase(core, ancestor, &mut event, EventPhase::Bubble);
            if event.propagation_stopped() {
                break;
            }
        }
    }

    event.set_phase(EventPhase::None);
    Ok(!event.default_prevented())
}

fn run_phase<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    event: &mut Event,
    phase: EventPhase,
) {
    let snapshot = {
        let c = core.borrow();
        let Some(ctrl) = c.ctrl(id) else {
            return;
        };
        match phase {
            EventPhase::Capture => ctrl.listeners.snapshot(event.name(), true),
            EventPhase::Bubble => ctrl.listeners.snapshot(event.name(), false),
            // At the target every listener fires, registration order.
            _ => ctrl.listeners.snapshot_all(event.name()),
        }
    };

    event.set_phase(phase);
    for listener in snapshot {
        let live = {
            let mut c = core.borrow_mut();
            match c.ctrl_mut(id) {
                Some(ctrl) if ctrl.listeners.contains(&listener) => {
                    if listener.once {
                        // Deregistered before the handler body runs, so a
                        // re-dispatch from inside it cannot fire it again.
                        ctrl.listeners.remove_record(&listener);
                    }
                    true
                }
                _ => false,
            }
        };
        if !live {
            continue;
        }

        if let Err(err) = (listener.callback)(event) {
            error!(event = event.name(), "event listener failed: {err}");
        }
        if event.immediate_stopped() {
            break;
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// The per-component controller handle passed to component bodies.
///
/// Cheap to clone; all methods are safe to call from inside the body,
/// from listeners, and from scheduled callbacks.
pub struct Context<A: HostAdapter> {
    core: Weak<RefCell<Core<A>>>,
    id: NodeId,
}

impl<A: HostAdapter> Clone for Context<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            id: self.id,
        }
    }
}

impl<A: HostAdapter> Context<A> {
    pub(crate) fn new(core: Weak<RefCell<Core<A>>>, id: NodeId) -> Self {
        Self { core, id }
    }

    /// A context bound to nothing; props pulls and refreshes fail or
    /// no-op. Used by driver unit tests.
    pub(crate) fn detached() -> Self {
        Self {
            core: Weak::new(),
            id: NodeId::dangling(),
        }
    }

    fn upgrade(&self) -> Option<Rc<RefCell<Core<A>>>> {
        self.core.upgrade()
    }

    /// Pull the current props.
    ///
    /// Generator bodies pull once per iteration; pulling again before
    /// yielding is a protocol violation.
    pub fn props(&self) -> Result<Props<A>> {
        let Some(rc) = self.upgrade() else {
            return Err(RenderError::Protocol("context is detached".into()));
        };
        let mut c = rc.borrow_mut();
        let props = c.nodes.get(self.id).map(|node| node.props.clone());
        let Some(ctrl) = c.ctrl_mut(self.id) else {
            return Err(RenderError::Protocol("context is unmounted".into()));
        };
        if ctrl.iterating {
            return Err(RenderError::Protocol(
                "context iterated twice without an intervening yield".into(),
            ));
        }
        ctrl.iterating = true;
        props.ok_or_else(|| RenderError::Protocol("context is unmounted".into()))
    }

    /// Request a re-render of this component.
    pub fn refresh(&self) -> Result<()> {
        let Some(rc) = self.upgrade() else {
            return Ok(());
        };
        let outcome = ctrl_refresh(&rc, self.id);
        renderer::flush_deferred(&rc);
        outcome.map(|_| ())
    }

    /// Register a one-shot callback invoked with the committed value on
    /// the next commit.
    pub fn schedule(&self, cb: impl FnOnce(Value<A::Node>) + 'static) {
        if let Some(rc) = self.upgrade()
            && let Some(ctrl) = rc.borrow_mut().ctrl_mut(self.id)
        {
            ctrl.schedule_cbs.push(Box::new(cb));
        }
    }

    /// Register a callback invoked with the last committed value when
    /// this component unmounts.
    pub fn cleanup(&self, cb: impl FnOnce(Value<A::Node>) + 'static) {
        if let Some(rc) = self.upgrade()
            && let Some(ctrl) = rc.borrow_mut().ctrl_mut(self.id)
        {
            ctrl.cleanup_cbs.push(Box::new(cb));
        }
    }

    /// Provide a keyed value to descendant controllers.
    pub fn set(&self, key: impl Into<String>, value: Rc<dyn Any>) {
        if let Some(rc) = self.upgrade()
            && let Some(ctrl) = rc.borrow_mut().ctrl_mut(self.id)
        {
            ctrl.provisions.insert(key.into(), value);
        }
    }

    /// Look a provision up the controller chain, nearest provider wins.
    pub fn get(&self, key: &str) -> Option<Rc<dyn Any>> {
        let rc = self.upgrade()?;
        let c = rc.borrow();
        let mut cursor = c.ctrl(self.id)?.parent_ctrl;
        while let Some(ancestor) = cursor {
            let ctrl = c.ctrl(ancestor)?;
            if let Some(value) = ctrl.provisions.get(key) {
                return Some(value.clone());
            }
            cursor = ctrl.parent_ctrl;
        }
        None
    }

    /// The last committed value of this component, externally readable.
    pub fn value(&self) -> Value<A::Node> {
        let Some(rc) = self.upgrade() else {
            return Value::None;
        };
        let c = rc.borrow();
        match c.nodes.get(self.id) {
            Some(node) => c.adapter.read(&node.value),
            None => Value::None,
        }
    }

    /// Register an event listener. Returns the shared callback handle
    /// used for removal; re-adding an identical (name, callback,
    /// capture) triple is a no-op.
    pub fn add_event_listener(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&mut Event) -> Result<()> + 'static,
        options: ListenerOptions,
    ) -> ListenerFn {
        let callback: ListenerFn = Rc::new(callback);
        self.add_shared_listener(name, callback.clone(), options);
        callback
    }

    /// Register an already-shared listener callback.
    pub fn add_shared_listener(
        &self,
        name: impl Into<String>,
        callback: ListenerFn,
        options: ListenerOptions,
    ) -> bool {
        let Some(rc) = self.upgrade() else {
            return false;
        };
        let mut c = rc.borrow_mut();
        let Some(ctrl) = c.ctrl_mut(self.id) else {
            return false;
        };
        ctrl.listeners.add(Listener {
            name: name.into(),
            callback,
            capture: options.capture,
            once: options.once,
        })
    }

    /// Remove by (name, callback, capture) identity.
    pub fn remove_event_listener(&self, name: &str, callback: &ListenerFn, capture: bool) -> bool {
        let Some(rc) = self.upgrade() else {
            return false;
        };
        let mut c = rc.borrow_mut();
        match c.ctrl_mut(self.id) {
            Some(ctrl) => ctrl.listeners.remove(name, callback, capture),
            None => false,
        }
    }

    /// Dispatch an event from this component through capture, target,
    /// and bubble phases. Returns whether the default was not prevented.
    pub fn dispatch_event(&self, event: Event) -> Result<bool> {
        let Some(rc) = self.upgrade() else {
            return Ok(true);
        };
        let result = dispatch(&rc, self.id, event);
        renderer::flush_deferred(&rc);
        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::channel::oneshot;

    use super::*;
    use crate::adapter::ValueAtom;
    use crate::component::{async_gen_fn, catching_gen_fn, gen_fn};
    use crate::element::{Child, Element};
    use crate::renderer::{RenderOutcome, Renderer};
    use crate::testutil::{MockAdapter, Op};

    const ROOT: u32 = 1000;

    type CtxSlot = Rc<RefCell<Option<Context<MockAdapter>>>>;

    fn renderer() -> (Renderer<MockAdapter>, Rc<RefCell<Vec<Op>>>) {
        let adapter = MockAdapter::new();
        let ops = adapter.ops.clone();
        (Renderer::new(adapter), ops)
    }

    fn last_root_arrange(ops: &Rc<RefCell<Vec<Op>>>) -> Option<Vec<String>> {
        ops.borrow().iter().rev().find_map(|op| match op {
            Op::Arrange { node, children, .. } if *node == ROOT => Some(children.clone()),
            _ => None,
        })
    }

    fn all_root_arranges(ops: &Rc<RefCell<Vec<Op>>>) -> Vec<Vec<String>> {
        ops.borrow()
            .iter()
            .filter_map(|op| match op {
                Op::Arrange { node, children, .. } if *node == ROOT => Some(children.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_generator_refresh_rerenders_out_of_band() {
        let (mut renderer, ops) = renderer();
        let slot: CtxSlot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        let spec = ComponentSpec::generator("Counter", move || {
            let sink = sink.clone();
            let mut count = 0i64;
            gen_fn(move |ctx, _input| {
                *sink.borrow_mut() = Some(ctx.clone());
                count += 1;
                Ok(Flow::Continue(Child::Text(count.to_string())))
            })
        });

        renderer.render(Element::component(spec), ROOT).unwrap();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"1\""]);

        let ctx = slot.borrow().clone().unwrap();
        ctx.refresh().unwrap();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"2\""]);
        ctx.refresh().unwrap();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"3\""]);
    }

    #[test]
    fn test_double_props_pull_is_protocol_fault() {
        let (mut renderer, _ops) = renderer();
        let spec = ComponentSpec::generator("Greedy", || {
            gen_fn(|ctx, _input| {
                let _ = ctx.props()?;
                let _ = ctx.props()?;
                Ok(Flow::Continue(Child::None))
            })
        });

        let err = renderer.render(Element::component(spec), ROOT).unwrap_err();
        assert!(matches!(err, RenderError::Protocol(_)));
    }

    #[test]
    fn test_finished_generator_keeps_last_value() {
        let (mut renderer, ops) = renderer();
        let resumes = Rc::new(RefCell::new(0u32));
        let counter = resumes.clone();
        let spec = ComponentSpec::generator("Once", move || {
            let counter = counter.clone();
            gen_fn(move |_ctx, _input| {
                *counter.borrow_mut() += 1;
                Ok(Flow::Complete(Child::Text("done".into())))
            })
        });

        renderer
            .render(Element::component(spec.clone()).attr("n", 1), ROOT)
            .unwrap();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"done\""]);

        // New props reach a finished body as a no-op.
        renderer
            .render(Element::component(spec).attr("n", 2), ROOT)
            .unwrap();
        assert_eq!(*resumes.borrow(), 1);
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"done\""]);
    }

    #[test]
    fn test_coalesced_async_update_discards_stale_result() {
        let (mut renderer, ops) = renderer();
        let queue: Rc<RefCell<VecDeque<oneshot::Receiver<String>>>> =
            Rc::new(RefCell::new(VecDeque::new()));
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queue.borrow_mut().push_back(rx1);
        queue.borrow_mut().push_back(rx2);

        let source = queue.clone();
        let spec = ComponentSpec::async_function("Race", move |_, _| {
            let rx = source.borrow_mut().pop_front();
            Box::pin(async move {
                let text = match rx {
                    Some(rx) => rx.await.unwrap_or_default(),
                    None => String::new(),
                };
                Ok(Child::Text(text))
            })
        });

        // Two updates while the first is still in flight coalesce; the
        // first step's settled value must never commit.
        let first = renderer
            .render(Element::component(spec.clone()).attr("n", 1), ROOT)
            .unwrap();
        assert_eq!(first, RenderOutcome::Pending);
        let second = renderer
            .render(Element::component(spec).attr("n", 2), ROOT)
            .unwrap();
        assert_eq!(second, RenderOutcome::Pending);

        tx2.send("two".into()).unwrap();
        tx1.send("one".into()).unwrap();
        renderer.turn();

        let arranges = all_root_arranges(&ops);
        assert_eq!(arranges, vec![vec!["\"two\"".to_string()]]);
        assert!(renderer.take_error().is_none());
    }

    #[test]
    fn test_async_generator_buffers_newest_props() {
        let (mut renderer, ops) = renderer();
        let queue: Rc<RefCell<VecDeque<oneshot::Receiver<()>>>> =
            Rc::new(RefCell::new(VecDeque::new()));
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queue.borrow_mut().push_back(rx1);
        queue.borrow_mut().push_back(rx2);

        let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let observed = seen.clone();
        let source = queue.clone();
        let spec = ComponentSpec::async_generator("Buffered", move || {
            let observed = observed.clone();
            let source = source.clone();
            async_gen_fn(move |_ctx, input| {
                let props = match input {
                    Resumption::Props(props) => props,
                    _ => return Box::pin(async { Ok(Flow::Complete(Child::None)) }),
                };
                let n = props.get("n").and_then(|v| v.as_int()).unwrap_or(0);
                observed.borrow_mut().push(n);
                let rx = source.borrow_mut().pop_front();
                Box::pin(async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    Ok(Flow::Continue(Child::Text(n.to_string())))
                })
            })
        });

        renderer
            .render(Element::component(spec.clone()).attr("n", 1), ROOT)
            .unwrap();
        renderer
            .render(Element::component(spec).attr("n", 2), ROOT)
            .unwrap();

        // Unlike plain async bodies, the in-flight step's value still
        // commits; the buffered props drive one follow-up step.
        tx1.send(()).unwrap();
        renderer.turn();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"1\""]);
        assert_eq!(seen.borrow().clone(), vec![1, 2]);

        tx2.send(()).unwrap();
        renderer.turn();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"2\""]);
        assert!(renderer.take_error().is_none());
    }

    #[test]
    fn test_provisions_reach_descendants() {
        let (mut renderer, ops) = renderer();
        let consumer = ComponentSpec::function("Consumer", |ctx, _| {
            let theme = ctx
                .get("theme")
                .and_then(|v| v.downcast::<String>().ok())
                .map(|v| (*v).clone())
                .unwrap_or_else(|| "unset".into());
            Ok(Child::Text(theme))
        });

        let child = consumer.clone();
        let provider = ComponentSpec::generator("Provider", move || {
            let child = child.clone();
            gen_fn(move |ctx, input| match input {
                Resumption::Finish => Ok(Flow::Complete(Child::None)),
                _ => {
                    ctx.set("theme", Rc::new("dark".to_string()));
                    Ok(Flow::Continue(Child::Element(Element::component(
                        child.clone(),
                    ))))
                }
            })
        });

        renderer.render(Element::component(provider), ROOT).unwrap();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"dark\""]);

        // Without a provider above it, the consumer sees nothing.
        renderer.render(Element::component(consumer), ROOT).unwrap();
        assert_eq!(last_root_arrange(&ops).unwrap(), vec!["\"unset\""]);
    }

    /// Mount a parent component wrapping a child component and hand back
    /// both contexts for listener tests.
    fn mount_pair(renderer: &mut Renderer<MockAdapter>) -> (Context<MockAdapter>, Context<MockAdapter>) {
        let parent_slot: CtxSlot = Rc::new(RefCell::new(None));
        let child_slot: CtxSlot = Rc::new(RefCell::new(None));

        let child_sink = child_slot.clone();
        let child = ComponentSpec::function("Inner", move |ctx, _| {
            *child_sink.borrow_mut() = Some(ctx);
            Ok(Child::None)
        });

        let parent_sink = parent_slot.clone();
        let parent = ComponentSpec::generator("Outer", move || {
            let parent_sink = parent_sink.clone();
            let child = child.clone();
            gen_fn(move |ctx, _| {
                *parent_sink.borrow_mut() = Some(ctx.clone());
                Ok(Flow::Continue(Child::Element(Element::component(
                    child.clone(),
                ))))
            })
        });

        renderer.render(Element::component(parent), ROOT).unwrap();
        let parent_ctx = parent_slot.borrow().clone().unwrap();
        let child_ctx = child_slot.borrow().clone().unwrap();
        (parent_ctx, child_ctx)
    }

    #[test]
    fn test_dispatch_capture_target_bubble_order() {
        let (mut renderer, _ops) = renderer();
        let (parent_ctx, child_ctx) = mount_pair(&mut renderer);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        parent_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("capture");
                Ok(())
            },
            ListenerOptions::capture(),
        );
        let log = order.clone();
        parent_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("bubble");
                Ok(())
            },
            ListenerOptions::default(),
        );
        let log = order.clone();
        child_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("target");
                Ok(())
            },
            ListenerOptions::default(),
        );

        let handled = child_ctx
            .dispatch_event(Event::new("ping").bubbles(true))
            .unwrap();
        assert!(handled);
        assert_eq!(order.borrow().clone(), vec!["capture", "target", "bubble"]);

        // A non-bubbling event skips the bubble phase.
        order.borrow_mut().clear();
        child_ctx.dispatch_event(Event::new("ping")).unwrap();
        assert_eq!(order.borrow().clone(), vec!["capture", "target"]);
    }

    #[test]
    fn test_immediate_stop_in_capture_prevents_target() {
        let (mut renderer, _ops) = renderer();
        let (parent_ctx, child_ctx) = mount_pair(&mut renderer);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        parent_ctx.add_event_listener(
            "ping",
            move |event| {
                log.borrow_mut().push("capture");
                event.stop_immediate_propagation();
                Ok(())
            },
            ListenerOptions::capture(),
        );
        let log = order.clone();
        child_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("target");
                Ok(())
            },
            ListenerOptions::default(),
        );

        child_ctx
            .dispatch_event(Event::new("ping").bubbles(true))
            .unwrap();
        assert_eq!(order.borrow().clone(), vec!["capture"]);
    }

    #[test]
    fn test_stop_propagation_finishes_current_phase() {
        let (mut renderer, _ops) = renderer();
        let (parent_ctx, child_ctx) = mount_pair(&mut renderer);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        child_ctx.add_event_listener(
            "ping",
            move |event| {
                log.borrow_mut().push("first");
                event.stop_propagation();
                Ok(())
            },
            ListenerOptions::default(),
        );
        let log = order.clone();
        child_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("second");
                Ok(())
            },
            ListenerOptions::default(),
        );
        let log = order.clone();
        parent_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("bubble");
                Ok(())
            },
            ListenerOptions::default(),
        );

        child_ctx
            .dispatch_event(Event::new("ping").bubbles(true))
            .unwrap();
        // The sibling listener in the same phase still runs; the bubble
        // phase does not.
        assert_eq!(order.borrow().clone(), vec!["first", "second"]);
    }

    #[test]
    fn test_once_listener_fires_once() {
        let (mut renderer, _ops) = renderer();
        let (_parent_ctx, child_ctx) = mount_pair(&mut renderer);
        let count = Rc::new(RefCell::new(0u32));

        let counter = count.clone();
        child_ctx.add_event_listener(
            "ping",
            move |_| {
                *counter.borrow_mut() += 1;
                Ok(())
            },
            ListenerOptions::once(),
        );

        child_ctx.dispatch_event(Event::new("ping")).unwrap();
        child_ctx.dispatch_event(Event::new("ping")).unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_listener_error_does_not_interrupt_dispatch() {
        let (mut renderer, _ops) = renderer();
        let (_parent_ctx, child_ctx) = mount_pair(&mut renderer);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        child_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("boom");
                Err(RenderError::Listener("boom".into()))
            },
            ListenerOptions::default(),
        );
        let log = order.clone();
        child_ctx.add_event_listener(
            "ping",
            move |_| {
                log.borrow_mut().push("after");
                Ok(())
            },
            ListenerOptions::default(),
        );

        let handled = child_ctx.dispatch_event(Event::new("ping")).unwrap();
        assert!(handled);
        assert_eq!(order.borrow().clone(), vec!["boom", "after"]);
    }

    #[test]
    fn test_prevent_default_reported_to_dispatcher() {
        let (mut renderer, _ops) = renderer();
        let (_parent_ctx, child_ctx) = mount_pair(&mut renderer);

        child_ctx.add_event_listener(
            "submit",
            |event| {
                event.prevent_default();
                Ok(())
            },
            ListenerOptions::default(),
        );

        let handled = child_ctx.dispatch_event(Event::new("submit")).unwrap();
        assert!(!handled);
    }

    #[test]
    fn test_remove_event_listener_by_identity() {
        let (mut renderer, _ops) = renderer();
        let (_parent_ctx, child_ctx) = mount_pair(&mut renderer);
        let count = Rc::new(RefCell::new(0u32));

        let counter = count.clone();
        let handle = child_ctx.add_event_listener(
            "ping",
            move |_| {
                *counter.borrow_mut() += 1;
                Ok(())
            },
            ListenerOptions::default(),
        );

        // Wrong capture flag is a different registration.
        assert!(!child_ctx.remove_event_listener("ping", &handle, true));
        assert!(child_ctx.remove_event_listener("ping", &handle, false));
        child_ctx.dispatch_event(Event::new("ping")).unwrap();
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn test_generator_finalized_on_sync_unmount() {
        let (mut renderer, _ops) = renderer();
        let finished = Rc::new(RefCell::new(false));
        let flag = finished.clone();
        let spec = ComponentSpec::generator("Graceful", move || {
            let flag = flag.clone();
            gen_fn(move |_ctx, input| match input {
                Resumption::Finish => {
                    *flag.borrow_mut() = true;
                    Ok(Flow::Complete(Child::None))
                }
                _ => Ok(Flow::Continue(Child::Text("x".into()))),
            })
        });

        renderer.render(Element::component(spec), ROOT).unwrap();
        assert!(!*finished.borrow());

        // Replacing the component displaces and finalizes it.
        renderer.render(Element::host("div"), ROOT).unwrap();
        assert!(*finished.borrow());
    }

    #[test]
    fn test_zombie_finalize_is_protocol_fault() {
        let (mut renderer, _ops) = renderer();
        let spec = ComponentSpec::generator("Zombie", || {
            gen_fn(|_ctx, input| match input {
                Resumption::Finish => Ok(Flow::Continue(Child::Text("still here".into()))),
                _ => Ok(Flow::Continue(Child::Text("x".into()))),
            })
        });

        renderer.render(Element::component(spec), ROOT).unwrap();
        let err = renderer.render(Child::None, ROOT).unwrap_err();
        assert!(matches!(err, RenderError::Protocol(_)));
    }

    #[test]
    fn test_cleanup_runs_once_with_async_finalization() {
        let (mut renderer, _ops) = renderer();
        let cleanups: Rc<RefCell<Vec<Value<u32>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = cleanups.clone();
        let spec = ComponentSpec::async_generator("Teardown", move || {
            let sink = sink.clone();
            async_gen_fn(move |ctx, input| match input {
                Resumption::Props(_) => {
                    let sink = sink.clone();
                    ctx.cleanup(move |value| sink.borrow_mut().push(value));
                    Box::pin(async { Ok(Flow::Continue(Child::Text("v".into()))) })
                }
                Resumption::Finish => Box::pin(async { Ok(Flow::Complete(Child::None)) }),
                Resumption::Error(err) => Box::pin(async move { Err(err) }),
            })
        });

        renderer.render(Element::component(spec), ROOT).unwrap();
        renderer.turn();
        assert_eq!(renderer.read_root(&ROOT).unwrap(), Value::Single(ValueAtom::Text("v".into())));

        renderer.render(Child::None, ROOT).unwrap();
        // Finalization is asynchronous; nothing has run yet.
        assert!(cleanups.borrow().is_empty());

        renderer.turn();
        assert_eq!(
            cleanups.borrow().clone(),
            vec![Value::Single(ValueAtom::Text("v".into()))]
        );
        assert_eq!(renderer.live_nodes(), 0);
        assert!(renderer.take_error().is_none());
    }

    #[test]
    fn test_child_commit_error_injected_into_catching_generator() {
        let (mut renderer, ops) = renderer();
        let failing = ComponentSpec::function("Broken", |_, _| {
            Err(RenderError::Component("boom".into()))
        });

        let child = failing.clone();
        let guard = ComponentSpec::generator("Guard", move || {
            let child = child.clone();
            catching_gen_fn(move |_ctx, input| match input {
                Resumption::Error(err) => {
                    Ok(Flow::Continue(Child::Text(format!("caught: {err}"))))
                }
                _ => Ok(Flow::Continue(Child::Element(Element::component(
                    child.clone(),
                )))),
            })
        });

        renderer.render(Element::component(guard), ROOT).unwrap();
        assert_eq!(
            last_root_arrange(&ops).unwrap(),
            vec!["\"caught: component error: boom\""]
        );

        // A body without the capability propagates the same error.
        let plain = ComponentSpec::function("Relay", move |_, _| {
            Ok(Child::Element(Element::component(failing.clone())))
        });
        let err = renderer
            .render(Element::component(plain), 2000)
            .unwrap_err();
        assert!(matches!(err, RenderError::Component(_)));
    }
}
