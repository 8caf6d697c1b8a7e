//! Child reconciliation - aligning one element's new children against
//! its retained children.
//!
//! Alignment is a single forward walk. Unkeyed children consume the
//! next unkeyed retained slot positionally; keyed children look up a
//! key map built lazily from the not-yet-consumed retained slots the
//! first time a keyed child appears. A key seen twice in one pass
//! demotes the second occurrence to unkeyed. `Copy` keeps whatever
//! occupied its slot, untouched.
//!
//! A matched slot is updated in place only when the tags match (host by
//! name, component by spec identity, portal regardless of target);
//! otherwise the old node is displaced to the graveyard and a fresh one
//! mounts. Displaced nodes are unmounted after the pass: immediately
//! for a synchronous pass, at resolution or supersession for a pending
//! one.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::debug;

use crate::adapter::{HostAdapter, Value};
use crate::controller::Ctrl;
use crate::element::{Child, Element, Key, Narrowed, Tag, narrow};
use crate::error::{RenderError, Result};
use crate::renderer::{
    self, Core, NodeId, Outcome, PendingPass, RChild, RNode, RTag, ResolveLink,
};

struct OldSlot {
    child: RChild,
    key: Option<Key>,
}

/// Reconcile `new_children` into the retained children of `id`.
///
/// Returns `Ready` when every child committed synchronously; `Pending`
/// leaves a [`PendingPass`] on the node and arms resolve links on the
/// unsettled children.
pub(crate) fn update_children<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    new_children: Vec<Child<A>>,
) -> Result<Outcome> {
    // Snapshot phase: bump the generation, derive the child scope, take
    // the old slots, and supersede any unresolved previous pass.
    let (old, generation, child_scope, mut superseded) = {
        let mut c = core.borrow_mut();
        enum ScopeSource<A: HostAdapter> {
            Derive(String, crate::element::Props<A>, Option<A::Scope>),
            Reset,
            Inherit(Option<A::Scope>),
        }
        let source = match c.nodes.get(id) {
            None => return Ok(Outcome::Ready),
            Some(node) => match &node.tag {
                RTag::Host { tag, .. } => {
                    ScopeSource::Derive(tag.clone(), node.props.clone(), node.scope.clone())
                }
                RTag::Portal { .. } => ScopeSource::Reset,
                _ => ScopeSource::Inherit(node.scope.clone()),
            },
        };
        let child_scope = match source {
            ScopeSource::Derive(tag, props, parent) => {
                c.adapter.scope(&tag, &props, parent.as_ref())
            }
            ScopeSource::Reset => None,
            ScopeSource::Inherit(scope) => scope,
        };

        let Some(node) = c.nodes.get_mut(id) else {
            return Ok(Outcome::Ready);
        };
        node.generation = node.generation.wrapping_add(1);
        node.child_scope = child_scope.clone();
        let generation = node.generation;
        let superseded = node
            .pending
            .take()
            .map(|pass| pass.graveyard)
            .unwrap_or_default();
        let old_children = std::mem::take(&mut node.children);

        let old: Vec<OldSlot> = old_children
            .into_iter()
            .map(|child| {
                let key = match &child {
                    RChild::Node(child_id) => {
                        c.nodes.get(*child_id).and_then(|n| n.key.clone())
                    }
                    _ => None,
                };
                OldSlot { child, key }
            })
            .collect();
        (old, generation, child_scope, superseded)
    };

    // Walk phase.
    let mut cursor = 0usize;
    let mut used: HashSet<usize> = HashSet::new();
    let mut key_map: Option<HashMap<Key, usize>> = None;
    let mut seen: HashSet<Key> = HashSet::new();
    let mut slots: Vec<RChild> = Vec::with_capacity(new_children.len());
    let mut pending_children: Vec<NodeId> = Vec::new();
    let mut graveyard: Vec<NodeId> = Vec::new();

    for child in new_children {
        let narrowed = narrow(child);
        let key = match narrowed.key() {
            Some(k) if seen.insert(k.clone()) => Some(k.clone()),
            Some(k) => {
                debug!(key = ?k, "duplicate key in one children pass, treating as unkeyed");
                None
            }
            None => None,
        };

        let old_index = if let Some(k) = &key {
            // Keyed slots are only ever consumed through the map, so it
            // covers every retained slot not yet claimed, including
            // keyed slots the positional cursor has already stepped over.
            let map = key_map.get_or_insert_with(|| {
                let mut map = HashMap::new();
                for (i, slot) in old.iter().enumerate() {
                    if used.contains(&i) {
                        continue;
                    }
                    if let Some(key) = &slot.key {
                        map.entry(key.clone()).or_insert(i);
                    }
                }
                map
            });
            match map.remove(k) {
                Some(i) => {
                    used.insert(i);
                    Some(i)
                }
                None => None,
            }
        } else {
            // Keyed retained slots are invisible to positional matching.
            while cursor < old.len() && (used.contains(&cursor) || old[cursor].key.is_some()) {
                cursor += 1;
            }
            if cursor < old.len() {
                let i = cursor;
                used.insert(i);
                cursor += 1;
                Some(i)
            } else {
                None
            }
        };
        let old_slot = old_index.map(|i| old[i].child.clone());

        match narrowed {
            Narrowed::None => {
                if let Some(RChild::Node(dead)) = old_slot {
                    graveyard.push(dead);
                }
                slots.push(RChild::None);
            }
            Narrowed::Text(text) => {
                if let Some(RChild::Node(dead)) = old_slot {
                    graveyard.push(dead);
                }
                slots.push(RChild::Text(text));
            }
            Narrowed::Element(el) => {
                if matches!(el.tag, Tag::Copy) {
                    slots.push(old_slot.unwrap_or(RChild::None));
                    continue;
                }

                let reusable = match &old_slot {
                    Some(RChild::Node(old_id)) => {
                        let c = core.borrow();
                        c.nodes
                            .get(*old_id)
                            .is_some_and(|node| tag_matches(&node.tag, &el.tag))
                            .then_some(*old_id)
                    }
                    _ => None,
                };

                let child_id = match reusable {
                    Some(old_id) => {
                        prepare_in_place(core, old_id, el)?;
                        old_id
                    }
                    None => {
                        if let Some(RChild::Node(dead)) = old_slot {
                            graveyard.push(dead);
                        }
                        mount_element(core, id, el, child_scope.clone())?
                    }
                };

                let outcome = renderer::update_node(core, child_id)?;
                if outcome == Outcome::Pending {
                    pending_children.push(child_id);
                }
                slots.push(RChild::Node(child_id));
            }
        }
    }

    // Retained slots nothing claimed are displaced.
    for (i, slot) in old.iter().enumerate() {
        if used.contains(&i) {
            continue;
        }
        if let RChild::Node(dead) = slot.child {
            graveyard.push(dead);
        }
    }

    // Finalize phase.
    let outcome = {
        let mut c = core.borrow_mut();
        let Some(node) = c.nodes.get_mut(id) else {
            return Ok(Outcome::Ready);
        };
        node.children = slots;
        if pending_children.is_empty() {
            Outcome::Ready
        } else {
            node.pending = Some(PendingPass {
                generation,
                remaining: pending_children.len(),
                graveyard: std::mem::take(&mut graveyard),
            });
            for &child_id in &pending_children {
                if let Some(child) = c.nodes.get_mut(child_id) {
                    child.resolve_link = Some(ResolveLink {
                        parent: id,
                        generation,
                    });
                }
            }
            Outcome::Pending
        }
    };

    // A superseded pass's displaced nodes come down now, exactly once;
    // the current pass's graveyard only when the pass itself resolves.
    superseded.extend(graveyard);
    for dead in superseded {
        renderer::unmount(core, dead, false)?;
    }
    Ok(outcome)
}

/// May `tag` update a retained node in place?
fn tag_matches<A: HostAdapter>(retained: &RTag<A>, tag: &Tag<A>) -> bool {
    match (retained, tag) {
        (RTag::Host { tag: a, .. }, Tag::Host(b)) => a == b,
        (RTag::Component(ctrl), Tag::Component(spec)) => Rc::ptr_eq(&ctrl.spec, spec),
        (RTag::Fragment, Tag::Fragment) => true,
        (RTag::Portal { .. }, Tag::Portal(_)) => true,
        (RTag::Raw { .. }, Tag::Raw) => true,
        _ => false,
    }
}

/// Write fresh props/key/ref onto a reused node. A portal switching
/// roots arranges its old root empty before adopting the new one.
fn prepare_in_place<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    id: NodeId,
    el: Element<A>,
) -> Result<()> {
    let mut c = core.borrow_mut();
    let Some(node) = c.nodes.get_mut(id) else {
        return Ok(());
    };
    let old_root = match (&mut node.tag, &el.tag) {
        (RTag::Portal { root }, Tag::Portal(new_root)) if root != new_root => {
            let old = root.clone();
            *root = new_root.clone();
            Some(old)
        }
        _ => None,
    };
    node.props = el.props;
    node.key = el.key;
    node.ref_ = el.ref_;

    if let Some(old_root) = old_root {
        c.adapter.arrange(None, &old_root, &[])?;
    }
    Ok(())
}

/// Allocate a retained node for a freshly mounted element.
fn mount_element<A: HostAdapter>(
    core: &Rc<RefCell<Core<A>>>,
    parent: NodeId,
    el: Element<A>,
    scope: Option<A::Scope>,
) -> Result<NodeId> {
    let mut c = core.borrow_mut();
    let tag = match el.tag {
        Tag::Host(tag) => RTag::Host { tag, node: None },
        Tag::Component(spec) => {
            let arranger = c.find_arranger(parent);
            let parent_ctrl = c.find_ctrl(parent);
            RTag::Component(Box::new(Ctrl::new(spec, parent_ctrl, arranger)))
        }
        Tag::Fragment => RTag::Fragment,
        Tag::Portal(root) => RTag::Portal { root },
        Tag::Raw => RTag::Raw {
            parsed: None,
            text: String::new(),
        },
        Tag::Copy => {
            return Err(RenderError::Protocol(
                "copy tag cannot mount into an empty slot".into(),
            ));
        }
    };
    Ok(c.nodes.insert(RNode {
        tag,
        props: el.props,
        key: el.key,
        ref_: el.ref_,
        parent: Some(parent),
        children: Vec::new(),
        value: Value::None,
        scope,
        child_scope: None,
        generation: 0,
        pending: None,
        resolve_link: None,
    }))
}

// =============================================================================
// Tests
// =============================================================================
