//! The renderer - retained tree, commit machinery, and the public
//! driver type.
//!
//! Rendering is split into two strictly ordered halves:
//!
//! 1. **Diff** ([`diff`]): align the new children of one element against
//!    its retained children, mount/update/displace as needed, and
//!    recurse. Displaced nodes land in the pass's graveyard.
//! 2. **Commit**: once a subtree's children have resolved, flatten their
//!    committed values (text-run normalization included), hand them to
//!    the host adapter (`patch` before `arrange`), cache the element's
//!    own value, then fire refs and schedule callbacks.
//!
//! Asynchronous children make a pass *pending*: the parent records the
//! pass generation and a remaining-count, and each pending child gets a
//! resolve link back to the parent. When the last child commits, the
//! parent commits and the pass's graveyard is unmounted. A newer pass
//! bumps the generation, so a stale child commit can never complete a
//! superseded pass; the superseded graveyard is unmounted at
//! supersession, exactly once.
//!
//! User callbacks (refs, schedule/cleanup, coalesced follow-up steps)
//! never run while the core is borrowed; they are queued on a deferred
//! list drained at the public entry points.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use tracing::error;

use crate::adapter::{HostAdapter, Value, ValueAtom, merge_text_runs};
use crate::controller::{self, Ctrl, Life};
use crate::element::{Child, Key, Props, RefFn};
use crate::error::{RenderError, Result};

mod arena;
pub(crate) mod diff;

pub(crate) use arena::Arena;
pub use arena::NodeId;

// =============================================================================
// Retained Nodes
// =============================================================================

/// One retained child slot. Absent slots are kept so later updates stay
/// positionally aligned.
#[derive(Clone)]
pub(crate) enum RChild {
    None,
    Text(String),
    Node(NodeId),
}

/// The retained counterpart of an element tag.
pub(crate) enum RTag<A: HostAdapter> {
    Host {
        tag: String,
        /// Created lazily at first commit.
        node: Option<A::Node>,
    },
    Component(Box<Ctrl<A>>),
    Fragment,
    Portal {
        root: A::Node,
    },
    Raw {
        parsed: Option<ValueAtom<A::Node>>,
        text: String,
    },
}

/// Book-keeping for a children pass with unresolved async members.
pub(crate) struct PendingPass {
    pub(crate) generation: u32,
    pub(crate) remaining: usize,
    /// Displaced nodes, unmounted when the pass resolves or is superseded.
    pub(crate) graveyard: Vec<NodeId>,
}

/// Fired when a pending child commits: count it against the parent's
/// pass with this generation.
#[derive(Clone, Copy)]
pub(crate) struct ResolveLink {
    pub(crate) parent: NodeId,
    pub(crate) generation: u32,
}

/// The renderer's mutable record of one mounted element.
pub(crate) struct RNode<A: HostAdapter> {
    pub(crate) tag: RTag<A>,
    pub(crate) props: Props<A>,
    pub(crate) key: Option<Key>,
    pub(crate) ref_: Option<RefFn<A>>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<RChild>,
    /// Last committed value.
    pub(crate) value: Value<A::Node>,
    /// Scope in effect at this element (derived by the parent).
    pub(crate) scope: Option<A::Scope>,
    /// Scope handed to this element's children; re-derived at host tags,
    /// reset at portals, inherited otherwise.
    pub(crate) child_scope: Option<A::Scope>,
    /// Bumped once per children pass; stale async completions compare
    /// against it and lose.
    pub(crate) generation: u32,
    pub(crate) pending: Option<PendingPass>,
    pub(crate) resolve_link: Option<ResolveLink>,
}

pub(crate) fn child_node_ids(children: &[RChild]) -> Vec<NodeId> {
    children
        .iter()
        .filter_map(|child| match child {
            RChild::Node(id) => Some(*id),
            _ => None,
        })
        .collect()
}

/// Did a children pass finish synchronously?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ready,
    Pending,
}

// =============================================================================
// Core
// =============================================================================

/// All renderer state behind one `RefCell`. Functions that re-enter
/// user code take `&Rc<RefCell<Core>>` and hold no borrow across the
/// call.
pub(crate) struct Core<A: HostAdapter> {
    pub(crate) adapter: A,
    pub(crate) nodes: Arena<RNode<A>>,
    pub(crate) roots: HashMap<A::Node, NodeId>,
    /// User callbacks queued for a borrow-free flush.
    pub(crate) deferred: VecDeque<Box<dyn FnOnce()>>,
    pub(crate) spawner: LocalSpawner,
    pub(crate) self_weak: Weak<RefCell<Core<A>>>,
    /// Errors from settled async steps that have no caller to return to.
    pub(crate) last_error: Option<RenderError>,
}

impl<A: HostAdapter> Core<A> {
    pub(crate) fn ctrl(&self, id: NodeId) -> Option<&Ctrl<A>> {
        match &self.nodes.get(id)?.tag {
            RTag::Component(ctrl) => Some(ctrl),
            _ => None,
        }
    }

    pub(crate) fn ctrl_mut(&mut self, id: NodeId) -> Option<&mut Ctrl<A>> {
        match &mut self.nodes.get_mut(id)?.tag {
            RTag::Component(ctrl) => Some(ctrl),
            _ => None,
        }
    }

    /// Nearest host or portal at-or-above `from`; a component's
    /// flattened output is arranged under this element.
    pub(crate) fn find_arranger(&self, from: NodeId) -> NodeId {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            match self.nodes.get(id) {
                Some(node) => match &node.tag {
                    RTag::Host { .. } | RTag::Portal { .. } => return id,
                    _ => cursor = node.parent,
                },
                None => break,
            }
        }
        // The render root is a portal, so the walk always terminates
        // there in practice.
        from
    }

    /// Nearest component at-or-above `from`.
    pub(crate) fn find_ctrl(&self, from: NodeId) -> Option<NodeId> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let node = self.nodes.get(id)?;
            if matches!(node.tag, RTag::Component(_)) {
                return Some(id);
            }
            cursor = node.parent;
        }
        None
    }

    /// Flatten the committed values of `id`'s children, escaping text
    /// runs and merging adjacent ones. Uncommitted hosts and portals
    /// contribute nothing; fragments and components are transparent.
    pub(crate) fn child_values(&mut self, id: NodeId) -> Result<Vec<ValueAtom<A::Node>>> {
        enum Step<N> {
            Atom(ValueAtom<N>),
            Skip,
            Recurse,
        }

        let (children, scope) = match self.nodes.get(id) {
            Some(node) => (node.children.clone(), node.child_scope.clone()),
            None => return Ok(Vec::new()),
        };

        let mut atoms = Vec::new();
        for child in children {
            match child {
                RChild::None => {}
                RChild::Text(text) => {
                    atoms.push(ValueAtom::Text(self.adapter.escape(&text, scope.as_ref())));
                }
                RChild::Node(child_id) => {
                    let step = match self.nodes.get(child_id) {
                        None => Step::Skip,
                        Some(node) => match &node.tag {
                            RTag::Host {
                                node: Some(host), ..
                            } => Step::Atom(ValueAtom::Node(host.clone())),
                            RTag::Host { node: None, .. } => Step::Skip,
                            RTag::Portal { .. } => Step::Skip,
                            RTag::Raw { parsed, .. } => match parsed {
                                Some(atom) => Step::Atom(atom.clone()),
                                None => Step::Skip,
                            },
                            RTag::Fragment | RTag::Component(_) => Step::Recurse,
                        },
                    };
                    match step {
                        Step::Atom(atom) => atoms.push(atom),
                        Step::Skip => {}
                        Step::Recurse => atoms.extend(self.child_values(child_id)?),
                    }
                }
            }
        }

        Ok(merge_text_runs(atoms))
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit one element whose children have all resolved: push the
    /// flattened child values to the host, cache the element's value,
    /// then queue refs and the resolve link.
    pub(crate) fn commit(&mut self, id: NodeId) -> Result<()> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        match &node.tag {
            RTag::Host { .. } => self.commit_host(id)?,
            RTag::Portal { .. } => self.commit_portal(id)?,
            RTag::Raw { .. } => self.commit_raw(id)?,
            RTag::Fragment => self.commit_fragment(id),
            RTag::Component(_) => self.commit_component(id)?,
        }

        let (ref_, link, value) = match self.nodes.get_mut(id) {
            Some(node) => (node.ref_.clone(), node.resolve_link.take(), node.value.clone()),
            None => return Ok(()),
        };
        if let Some(ref_fn) = ref_ {
            let value = self.adapter.read(&value);
            self.deferred.push_back(Box::new(move || ref_fn(&value)));
        }
        if let Some(link) = link {
            let weak = self.self_weak.clone();
            self.deferred.push_back(Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    child_resolved(&core, link.parent, link.generation);
                }
            }));
        }
        Ok(())
    }

    fn commit_host(&mut self, id: NodeId) -> Result<()> {
        let (tag, props, scope, existing) = match self.nodes.get(id) {
            Some(node) => match &node.tag {
                RTag::Host { tag, node: host } => (
                    tag.clone(),
                    node.props.clone(),
                    node.scope.clone(),
                    host.clone(),
                ),
                _ => return Ok(()),
            },
            None => return Ok(()),
        };

        let host = match existing {
            Some(host) => host,
            None => self.adapter.create(&tag, &props, scope.as_ref())?,
        };
        self.adapter.patch(&tag, &host, &props, scope.as_ref())?;
        let values = self.child_values(id)?;
        self.adapter.arrange(Some(&tag), &host, &values)?;

        if let Some(node) = self.nodes.get_mut(id) {
            if let RTag::Host { node: slot, .. } = &mut node.tag {
                *slot = Some(host.clone());
            }
            node.value = Value::Single(ValueAtom::Node(host));
        }
        Ok(())
    }

    fn commit_portal(&mut self, id: NodeId) -> Result<()> {
        let root = match self.nodes.get(id) {
            Some(node) => match &node.tag {
                RTag::Portal { root } => root.clone(),
                _ => return Ok(()),
            },
            None => return Ok(()),
        };
        let values = self.child_values(id)?;
        self.adapter.arrange(None, &root, &values)?;
        if let Some(node) = self.nodes.get_mut(id) {
            // Portals read as absent to the surrounding tree.
            node.value = Value::None;
        }
        Ok(())
    }

    fn commit_raw(&mut self, id: NodeId) -> Result<()> {
        let (text, scope, stale) = match self.nodes.get(id) {
            Some(node) => {
                let text = node
                    .props
                    .get("value")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                match &node.tag {
                    RTag::Raw { parsed, text: last } => {
                        let stale = parsed.is_none() || *last != text;
                        (text, node.scope.clone(), stale)
                    }
                    _ => return Ok(()),
                }
            }
            None => return Ok(()),
        };

        if stale {
            let atom = self.adapter.parse(&text, scope.as_ref())?;
            if let Some(node) = self.nodes.get_mut(id) {
                node.tag = RTag::Raw {
                    parsed: Some(atom.clone()),
                    text,
                };
                node.value = Value::Single(atom);
            }
        }
        Ok(())
    }

    fn commit_fragment(&mut self, id: NodeId) {
        let atoms = self.child_values(id).unwrap_or_default();
        if let Some(node) = self.nodes.get_mut(id) {
            node.value = Value::from_atoms(atoms);
        }
    }

    fn commit_component(&mut self, id: NodeId) -> Result<()> {
        let atoms = self.child_values(id)?;
        let value = Value::from_atoms(atoms);

        let (was_updating, schedules, arranger) = match self.nodes.get_mut(id) {
            Some(node) => {
                node.value = value.clone();
                let RTag::Component(ctrl) = &mut node.tag else {
                    return Ok(());
                };
                if ctrl.life == Life::Unmounted {
                    return Ok(());
                }
                let was_updating = ctrl.updating;
                ctrl.updating = false;
                ctrl.inflight = false;
                (
                    was_updating,
                    std::mem::take(&mut ctrl.schedule_cbs),
                    ctrl.arranger,
                )
            }
            None => return Ok(()),
        };

        if !was_updating {
            // Out-of-band commit (refresh or a settled async step): the
            // nearest host ancestor re-arranges with fresh values.
            self.rearrange(arranger)?;
        }

        for cb in schedules {
            let value = self.adapter.read(&value);
            self.deferred.push_back(Box::new(move || cb(value)));
        }

        // Run any coalesced follow-up once the deferred queue drains.
        let weak = self.self_weak.clone();
        self.deferred.push_back(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                controller::ctrl_follow_up(&core, id);
            }
        }));
        Ok(())
    }

    /// Re-push a host/portal element's flattened children to the host.
    fn rearrange(&mut self, id: NodeId) -> Result<()> {
        let target = match self.nodes.get(id) {
            Some(node) => match &node.tag {
                RTag::Host {
                    tag,
                    node: Some(host),
                } => Some((Some(tag.clone()), host.clone())),
                RTag::Portal { root } => Some((None, root.clone())),
                _ => None,
            },
            None => None,
        };
        let Some((tag, host)) = target else {
            return Ok(());
        };
        let values = self.child_values(id)?;
        self.adapter.arrange(tag.as_deref(), &host, &values)
    }
}

// =============================================================================
// Handle-Style Operations
// =============================================================================

/// Update one retained node after the diff refreshed its props.
pub(crate) fn update_node<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
) -> Result<Outcome> {
    enum Kind {
        Component,
        Leaf,
        Tree,
    }

    let kind = {
        let c = core.borrow();
        match c.nodes.get(id) {
            None => return Ok(Outcome::Ready),
            Some(node) => match &node.tag {
                RTag::Component(_) => Kind::Component,
                RTag::Raw { .. } => Kind::Leaf,
                _ => Kind::Tree,
            },
        }
    };

    match kind {
        Kind::Component => controller::ctrl_update(core, id),
        Kind::Leaf => {
            core.borrow_mut().commit(id)?;
            Ok(Outcome::Ready)
        }
        Kind::Tree => {
            let children = core
                .borrow()
                .nodes
                .get(id)
                .map(|node| node.props.children.clone())
                .unwrap_or_default();
            let outcome = diff::update_children(core, id, children)?;
            if outcome == Outcome::Ready {
                core.borrow_mut().commit(id)?;
            }
            Ok(outcome)
        }
    }
}

/// Reconcile the single child a component step yielded, committing the
/// component if the pass resolves synchronously.
pub(crate) fn update_component_children<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    child: Child<A>,
) -> Result<Outcome> {
    let outcome = diff::update_children(core, id, vec![child])?;
    if outcome == Outcome::Ready {
        core.borrow_mut().commit(id)?;
    }
    Ok(outcome)
}

/// One pending child of `parent` committed. Resolves the pass when it
/// was the last one; a stale generation is a superseded pass and is
/// ignored.
pub(crate) fn child_resolved<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    parent: NodeId,
    generation: u32,
) {
    let resolved = {
        let mut c = core.borrow_mut();
        let Some(node) = c.nodes.get_mut(parent) else {
            return;
        };
        match &mut node.pending {
            Some(pass) if pass.generation == generation => {
                pass.remaining = pass.remaining.saturating_sub(1);
                if pass.remaining == 0 {
                    node.pending.take()
                } else {
                    None
                }
            }
            _ => None,
        }
    };

    let Some(pass) = resolved else {
        return;
    };
    for dead in pass.graveyard {
        if let Err(err) = unmount(core, dead, false) {
            record_error(core, err);
        }
    }
    let committed = core.borrow_mut().commit(parent);
    if let Err(err) = committed {
        record_error(core, err);
    }
}

/// Unmount a retained node and release its slot. `root_level` is true
/// while the removed values are not already detached by a parent
/// re-arrange; hosts at that level are removed through the adapter.
pub(crate) fn unmount<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    root_level: bool,
) -> Result<()> {
    enum Kind<N> {
        Portal(N),
        Host(String, Option<N>),
        Fragment,
        Raw,
    }

    if core.borrow().ctrl(id).is_some() {
        return controller::ctrl_unmount(core, id, root_level);
    }

    let (kind, children, graveyard) = {
        let mut c = core.borrow_mut();
        let Some(node) = c.nodes.get_mut(id) else {
            return Ok(());
        };
        let graveyard = node.pending.take().map(|p| p.graveyard).unwrap_or_default();
        let children = child_node_ids(&node.children);
        let kind = match &node.tag {
            RTag::Portal { root } => Kind::Portal(root.clone()),
            RTag::Host { tag, node: host } => Kind::Host(tag.clone(), host.clone()),
            RTag::Fragment => Kind::Fragment,
            RTag::Raw { .. } => Kind::Raw,
            RTag::Component(_) => unreachable!("components unmount via their controller"),
        };
        (kind, children, graveyard)
    };

    for dead in graveyard {
        unmount(core, dead, false)?;
    }

    match kind {
        Kind::Portal(root) => {
            core.borrow_mut().adapter.arrange(None, &root, &[])?;
            for child in children {
                unmount(core, child, root_level)?;
            }
        }
        Kind::Host(tag, host) => {
            if root_level && let Some(host) = host {
                core.borrow_mut().adapter.remove(&tag, &host)?;
            }
            for child in children {
                unmount(core, child, false)?;
            }
        }
        Kind::Fragment => {
            for child in children {
                unmount(core, child, root_level)?;
            }
        }
        Kind::Raw => {}
    }

    core.borrow_mut().nodes.remove(id);
    Ok(())
}

/// Drain the deferred queue with no borrow held. Returns whether any
/// callback ran.
pub(crate) fn flush_deferred<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>) -> bool {
    let mut ran = false;
    loop {
        let job = core.borrow_mut().deferred.pop_front();
        match job {
            Some(job) => {
                ran = true;
                job();
            }
            None => break,
        }
    }
    ran
}

/// Queue a task on the renderer's cooperative executor.
pub(crate) fn spawn<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    task: impl Future<Output = ()> + 'static,
) {
    let spawner = core.borrow().spawner.clone();
    if let Err(err) = spawner.spawn_local(task) {
        error!("failed to spawn renderer task: {err}");
    }
}

/// Stash an error that settled with no caller to return to.
pub(crate) fn record_error<A: HostAdapter>(core: &Rc<RefCell<Core<A>>>, err: RenderError) {
    error!("{err}");
    core.borrow_mut().last_error = Some(err);
}

// =============================================================================
// Renderer
// =============================================================================

/// What a render call produced.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderOutcome<N> {
    /// Everything committed synchronously; this is the root's value.
    Ready(Value<N>),
    /// At least one component is awaiting; pump [`Renderer::turn`] and
    /// read the root afterwards.
    Pending,
}

/// The composition engine around one host adapter.
///
/// Single-threaded and cooperative: asynchronous component steps run on
/// an internal executor pumped by [`Renderer::turn`].
pub struct Renderer<A: HostAdapter> {
    core: Rc<RefCell<Core<A>>>,
    pool: LocalPool,
}

impl<A: HostAdapter> Renderer<A> {
    pub fn new(adapter: A) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(Core {
                adapter,
                nodes: Arena::new(),
                roots: HashMap::new(),
                deferred: VecDeque::new(),
                spawner,
                self_weak: weak.clone(),
                last_error: None,
            })
        });
        Self { core, pool }
    }

    /// Render `children` into the host value `root`.
    ///
    /// The first call against a root mounts an implicit portal; later
    /// calls diff against the retained tree. Rendering [`Child::None`]
    /// tears the root down (a root-level unmount).
    pub fn render(
        &mut self,
        children: impl Into<Child<A>>,
        root: A::Node,
    ) -> Result<RenderOutcome<A::Node>> {
        let child = children.into();
        let existing = self.core.borrow().roots.get(&root).copied();

        if matches!(child, Child::None) {
            if let Some(id) = existing {
                self.core.borrow_mut().roots.remove(&root);
                unmount(&self.core, id, true)?;
                flush_deferred(&self.core);
            }
            return Ok(RenderOutcome::Ready(Value::None));
        }

        let id = match existing {
            Some(id) => {
                let mut c = self.core.borrow_mut();
                if let Some(node) = c.nodes.get_mut(id) {
                    node.props.children = vec![child];
                }
                id
            }
            None => {
                let mut c = self.core.borrow_mut();
                let mut props = Props::new();
                props.children = vec![child];
                let id = c.nodes.insert(RNode {
                    tag: RTag::Portal { root: root.clone() },
                    props,
                    key: None,
                    ref_: None,
                    parent: None,
                    children: Vec::new(),
                    value: Value::None,
                    scope: None,
                    child_scope: None,
                    generation: 0,
                    pending: None,
                    resolve_link: None,
                });
                c.roots.insert(root, id);
                id
            }
        };

        let outcome = update_node(&self.core, id)?;
        flush_deferred(&self.core);
        match outcome {
            Outcome::Ready => Ok(RenderOutcome::Ready(self.root_value(id))),
            Outcome::Pending => Ok(RenderOutcome::Pending),
        }
    }

    /// Pump queued asynchronous steps until everything currently
    /// runnable has settled and the deferred queue is empty.
    pub fn turn(&mut self) {
        loop {
            self.pool.run_until_stalled();
            if !flush_deferred(&self.core) {
                break;
            }
        }
    }

    /// The committed value currently arranged under a render root.
    pub fn read_root(&self, root: &A::Node) -> Option<Value<A::Node>> {
        let id = *self.core.borrow().roots.get(root)?;
        Some(self.root_value(id))
    }

    /// Take the most recent error from an asynchronous step that had no
    /// caller to return to.
    pub fn take_error(&mut self) -> Option<RenderError> {
        self.core.borrow_mut().last_error.take()
    }

    /// Inspect the adapter (primarily for tests and demos).
    pub fn with_adapter<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&self.core.borrow().adapter)
    }

    /// Number of live retained nodes across all roots.
    pub fn live_nodes(&self) -> usize {
        self.core.borrow().nodes.len()
    }

    fn root_value(&self, id: NodeId) -> Value<A::Node> {
        let mut c = self.core.borrow_mut();
        let atoms = c.child_values(id).unwrap_or_default();
        let value = Value::from_atoms(atoms);
        c.adapter.read(&value)
    }
}

// =============================================================================
// Tests
// =============================================================================
