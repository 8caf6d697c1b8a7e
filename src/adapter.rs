//! Host adapter contract and committed value types.
//!
//! The renderer never touches a concrete host tree. Everything the
//! host must do - construct a node for a tag, apply prop changes,
//! arrange an ordered list of child values under a parent, destroy a
//! node - goes through [`HostAdapter`]. The engine calls these in a
//! strict discipline: an adapter operation must not call back into the
//! renderer.
//!
//! Committed values are [`ValueAtom`]s (a host node or a text run).
//! When the renderer flattens a subtree's values it applies text-run
//! normalization: adjacent text atoms are concatenated into a single
//! string before the list is handed to `arrange`.

use std::fmt::Debug;
use std::hash::Hash;

use crate::element::Props;
use crate::error::Result;

// =============================================================================
// Committed Values
// =============================================================================

/// One host-facing value: a text run or a host node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueAtom<N> {
    Text(String),
    Node(N),
}

/// The externally-readable committed value of an element.
///
/// Host elements commit a single node; components and fragments commit
/// the flattened value(s) of their descendants; portals read as `None`
/// (their output is opaque to the parent tree).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value<N> {
    None,
    Single(ValueAtom<N>),
    Many(Vec<ValueAtom<N>>),
}

impl<N> Value<N> {
    /// Collapse an atom list into a value: empty is absent, one atom is
    /// single, more stay a list.
    pub fn from_atoms(mut atoms: Vec<ValueAtom<N>>) -> Self {
        match atoms.len() {
            0 => Value::None,
            1 => Value::Single(atoms.remove(0)),
            _ => Value::Many(atoms),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// View the value as a slice-like atom list.
    pub fn atoms(&self) -> Vec<&ValueAtom<N>> {
        match self {
            Value::None => Vec::new(),
            Value::Single(atom) => vec![atom],
            Value::Many(atoms) => atoms.iter().collect(),
        }
    }
}

/// Concatenate adjacent text atoms into single strings.
///
/// This is the "text-run" normalization used when computing the values
/// handed to the host: `["a", "b", <node>]` becomes `["ab", <node>]`.
pub fn merge_text_runs<N>(atoms: Vec<ValueAtom<N>>) -> Vec<ValueAtom<N>> {
    let mut out: Vec<ValueAtom<N>> = Vec::with_capacity(atoms.len());
    let mut run: Option<String> = None;
    for atom in atoms {
        match atom {
            ValueAtom::Text(text) => match run.as_mut() {
                Some(buffer) => buffer.push_str(&text),
                None => run = Some(text),
            },
            ValueAtom::Node(node) => {
                if let Some(buffer) = run.take() {
                    out.push(ValueAtom::Text(buffer));
                }
                out.push(ValueAtom::Node(node));
            }
        }
    }

    if let Some(buffer) = run {
        out.push(ValueAtom::Text(buffer));
    }

    out
}

// =============================================================================
// Host Adapter
// =============================================================================

/// The create/patch/arrange/remove capability the renderer drives.
///
/// `Node` is the host's value type (a DOM handle, a widget id, a string
/// buffer index - anything cloneable and hashable; hashing is needed so
/// render roots can key the renderer cache). `Scope` is an opaque
/// contextual value propagated down the tree and re-derived at host-tag
/// boundaries (e.g. "inside a <pre>" for text escaping).
pub trait HostAdapter: Sized + 'static {
    type Node: Clone + Debug + PartialEq + Eq + Hash + 'static;
    type Scope: Clone + 'static;

    /// Construct a host node for `tag`.
    fn create(
        &mut self,
        tag: &str,
        props: &Props<Self>,
        scope: Option<&Self::Scope>,
    ) -> Result<Self::Node>;

    /// Apply prop changes to an existing host node.
    fn patch(
        &mut self,
        tag: &str,
        node: &Self::Node,
        props: &Props<Self>,
        scope: Option<&Self::Scope>,
    ) -> Result<()>;

    /// Arrange `children` (in order) under `node`. `tag` is the host
    /// tag, or `None` when `node` is a portal/render root.
    fn arrange(
        &mut self,
        tag: Option<&str>,
        node: &Self::Node,
        children: &[ValueAtom<Self::Node>],
    ) -> Result<()>;

    /// Destroy a host node. Called only for root-level unmounts; nested
    /// nodes disappear when their parent is re-arranged or removed.
    fn remove(&mut self, tag: &str, node: &Self::Node) -> Result<()>;

    /// Convert raw text into a host value (for the `Raw` control tag).
    fn parse(&mut self, text: &str, scope: Option<&Self::Scope>) -> Result<ValueAtom<Self::Node>>;

    /// Derive the contextual scope for children of a host tag.
    fn scope(
        &mut self,
        tag: &str,
        props: &Props<Self>,
        parent: Option<&Self::Scope>,
    ) -> Option<Self::Scope>;

    /// Escape a text run for the current scope. Identity by default.
    fn escape(&self, text: &str, _scope: Option<&Self::Scope>) -> String {
        text.to_string()
    }

    /// Map an internal committed value to the externally visible form
    /// handed to refs and render callers. Identity by default.
    fn read(&self, value: &Value<Self::Node>) -> Value<Self::Node> {
        value.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_text_runs() {
        let atoms: Vec<ValueAtom<u32>> = vec![
            ValueAtom::Text("a".into()),
            ValueAtom::Text("b".into()),
            ValueAtom::Node(7),
            ValueAtom::Text("c".into()),
        ];
        let merged = merge_text_runs(atoms);
        assert_eq!(
            merged,
            vec![
                ValueAtom::Text("ab".into()),
                ValueAtom::Node(7),
                ValueAtom::Text("c".into()),
            ]
        );
    }

    #[test]
    fn test_merge_text_runs_all_text() {
        let atoms: Vec<ValueAtom<u32>> =
            vec![ValueAtom::Text("x".into()), ValueAtom::Text("y".into())];
        assert_eq!(merge_text_runs(atoms), vec![ValueAtom::Text("xy".into())]);
    }

    #[test]
    fn test_value_from_atoms() {
        assert_eq!(Value::<u32>::from_atoms(vec![]), Value::None);
        assert_eq!(
            Value::<u32>::from_atoms(vec![ValueAtom::Node(1)]),
            Value::Single(ValueAtom::Node(1))
        );
        assert!(matches!(
            Value::<u32>::from_atoms(vec![ValueAtom::Node(1), ValueAtom::Node(2)]),
            Value::Many(_)
        ));
    }
}
