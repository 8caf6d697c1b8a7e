//! Element model - the data backbone of the composed tree.
//!
//! An [`Element`] is an authoring-time description of one tree node:
//! a tag, an ordered props map, an optional identity key, and an
//! optional ref callback. Elements carry no behavior and no committed
//! state; the renderer keeps its own retained records and consumes
//! authoring elements by value when it mounts them, so a mounted
//! element can never be aliased into a second slot.
//!
//! Child values are free-form ([`Child`]): absent, booleans, numbers,
//! strings, elements, or nested lists. [`narrow`] collapses a child to
//! one of {absent, string, element}; nested lists are wrapped in an
//! implicit `Fragment` element so they keep a stable identity across
//! updates.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::adapter::{HostAdapter, Value};
use crate::component::ComponentSpec;

// =============================================================================
// Keys
// =============================================================================

/// Identity token used to match children across reorderings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(value as i64)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}

// =============================================================================
// Prop Values
// =============================================================================

/// A single prop value.
///
/// Props are plain data. Callbacks are not props here; event handling
/// goes through the controller's listener registry instead.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PropValue>),
    Map(IndexMap<String, PropValue>),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<i32> for PropValue {
    fn from(value: i32) -> Self {
        PropValue::Int(value as i64)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<Vec<PropValue>> for PropValue {
    fn from(value: Vec<PropValue>) -> Self {
        PropValue::List(value)
    }
}

// =============================================================================
// Props
// =============================================================================

/// Ordered props mapping plus the children entry.
///
/// Attribute order is preserved (insertion order) so adapters can rely
/// on stable iteration when patching.
pub struct Props<A: HostAdapter> {
    pub attrs: IndexMap<String, PropValue>,
    pub children: Vec<Child<A>>,
}

impl<A: HostAdapter> Props<A> {
    pub fn new() -> Self {
        Self {
            attrs: IndexMap::new(),
            children: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.attrs.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Attribute-only equality; children are compared by the diff, not here.
    pub fn attrs_eq(&self, other: &Self) -> bool {
        self.attrs == other.attrs
    }
}

impl<A: HostAdapter> Default for Props<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: HostAdapter> Clone for Props<A> {
    fn clone(&self) -> Self {
        Self {
            attrs: self.attrs.clone(),
            children: self.children.clone(),
        }
    }
}

impl<A: HostAdapter> fmt::Debug for Props<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Props")
            .field("attrs", &self.attrs)
            .field("children", &self.children.len())
            .finish()
    }
}

// =============================================================================
// Tags
// =============================================================================

/// The closed set of tag shapes, resolved once per element by pattern
/// matching rather than runtime type probing.
pub enum Tag<A: HostAdapter> {
    /// A host tag the adapter knows how to create/patch/remove.
    Host(String),
    /// A component reference; one controller is allocated per mount.
    Component(Rc<ComponentSpec<A>>),
    /// Transparent grouping; contributes only its children's values.
    Fragment,
    /// Renders its children into the given host root; reads as absent.
    Portal(A::Node),
    /// Occupies a slot while intentionally skipping any update.
    Copy,
    /// Raw text handed to the adapter's `parse`.
    Raw,
}

impl<A: HostAdapter> Tag<A> {
    /// Diagnostic name of the tag shape.
    pub fn name(&self) -> String {
        match self {
            Tag::Host(tag) => tag.clone(),
            Tag::Component(spec) => spec.name().to_string(),
            Tag::Fragment => "Fragment".to_string(),
            Tag::Portal(_) => "Portal".to_string(),
            Tag::Copy => "Copy".to_string(),
            Tag::Raw => "Raw".to_string(),
        }
    }

    /// Whether an in-place update may reuse a retained node with `other`'s
    /// tag. Portals match regardless of target root (the renderer
    /// re-arranges the old root before switching); components match by
    /// spec identity, host tags by name.
    pub fn matches(&self, other: &Tag<A>) -> bool {
        match (self, other) {
            (Tag::Host(a), Tag::Host(b)) => a == b,
            (Tag::Component(a), Tag::Component(b)) => Rc::ptr_eq(a, b),
            (Tag::Fragment, Tag::Fragment) => true,
            (Tag::Portal(_), Tag::Portal(_)) => true,
            (Tag::Copy, Tag::Copy) => true,
            (Tag::Raw, Tag::Raw) => true,
            _ => false,
        }
    }
}

impl<A: HostAdapter> Clone for Tag<A> {
    fn clone(&self) -> Self {
        match self {
            Tag::Host(tag) => Tag::Host(tag.clone()),
            Tag::Component(spec) => Tag::Component(spec.clone()),
            Tag::Fragment => Tag::Fragment,
            Tag::Portal(root) => Tag::Portal(root.clone()),
            Tag::Copy => Tag::Copy,
            Tag::Raw => Tag::Raw,
        }
    }
}

impl<A: HostAdapter> fmt::Debug for Tag<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.name())
    }
}

// =============================================================================
// Elements
// =============================================================================

/// Ref callback invoked with the externally-readable committed value.
pub type RefFn<A> = Rc<dyn Fn(&Value<<A as HostAdapter>::Node>)>;

/// Immutable-intent description of one tree node.
pub struct Element<A: HostAdapter> {
    pub tag: Tag<A>,
    pub props: Props<A>,
    pub key: Option<Key>,
    pub ref_: Option<RefFn<A>>,
}

impl<A: HostAdapter> Element<A> {
    pub fn new(tag: Tag<A>) -> Self {
        Self {
            tag,
            props: Props::new(),
            key: None,
            ref_: None,
        }
    }

    /// A host-tag element, e.g. `Element::host("div")`.
    pub fn host(tag: impl Into<String>) -> Self {
        Self::new(Tag::Host(tag.into()))
    }

    /// A component element.
    pub fn component(spec: Rc<ComponentSpec<A>>) -> Self {
        Self::new(Tag::Component(spec))
    }

    pub fn fragment() -> Self {
        Self::new(Tag::Fragment)
    }

    /// A portal rendering its children into `root`.
    pub fn portal(root: A::Node) -> Self {
        Self::new(Tag::Portal(root))
    }

    pub fn copy() -> Self {
        Self::new(Tag::Copy)
    }

    /// Raw text handed to the adapter's `parse` at commit.
    pub fn raw(text: impl Into<String>) -> Self {
        let mut el = Self::new(Tag::Raw);
        el.props.set("value", text.into());
        el
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.set(name, value);
        self
    }

    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_ref(mut self, f: impl Fn(&Value<A::Node>) + 'static) -> Self {
        self.ref_ = Some(Rc::new(f));
        self
    }

    pub fn child(mut self, child: impl Into<Child<A>>) -> Self {
        self.props.children.push(child.into());
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Child<A>>) -> Self {
        self.props.children.extend(children);
        self
    }
}

impl<A: HostAdapter> Clone for Element<A> {
    fn clone(&self) -> Self {
        Self {
            tag: self.tag.clone(),
            props: self.props.clone(),
            key: self.key.clone(),
            ref_: self.ref_.clone(),
        }
    }
}

impl<A: HostAdapter> fmt::Debug for Element<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.tag)
            .field("key", &self.key)
            .finish()
    }
}

// =============================================================================
// Children
// =============================================================================

/// A free-form child value as authored.
pub enum Child<A: HostAdapter> {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Element(Element<A>),
    List(Vec<Child<A>>),
}

impl<A: HostAdapter> Clone for Child<A> {
    fn clone(&self) -> Self {
        match self {
            Child::None => Child::None,
            Child::Bool(b) => Child::Bool(*b),
            Child::Int(n) => Child::Int(*n),
            Child::Float(x) => Child::Float(*x),
            Child::Text(s) => Child::Text(s.clone()),
            Child::Element(el) => Child::Element(el.clone()),
            Child::List(list) => Child::List(list.clone()),
        }
    }
}

impl<A: HostAdapter> fmt::Debug for Child<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Child::None => write!(f, "None"),
            Child::Bool(b) => write!(f, "Bool({b})"),
            Child::Int(n) => write!(f, "Int({n})"),
            Child::Float(x) => write!(f, "Float({x})"),
            Child::Text(s) => write!(f, "Text({s:?})"),
            Child::Element(el) => write!(f, "{el:?}"),
            Child::List(list) => write!(f, "List(len={})", list.len()),
        }
    }
}

impl<A: HostAdapter> From<Element<A>> for Child<A> {
    fn from(value: Element<A>) -> Self {
        Child::Element(value)
    }
}

impl<A: HostAdapter> From<&str> for Child<A> {
    fn from(value: &str) -> Self {
        Child::Text(value.to_string())
    }
}

impl<A: HostAdapter> From<String> for Child<A> {
    fn from(value: String) -> Self {
        Child::Text(value)
    }
}

impl<A: HostAdapter> From<i64> for Child<A> {
    fn from(value: i64) -> Self {
        Child::Int(value)
    }
}

impl<A: HostAdapter> From<i32> for Child<A> {
    fn from(value: i32) -> Self {
        Child::Int(value as i64)
    }
}

impl<A: HostAdapter> From<f64> for Child<A> {
    fn from(value: f64) -> Self {
        Child::Float(value)
    }
}

impl<A: HostAdapter> From<bool> for Child<A> {
    fn from(value: bool) -> Self {
        Child::Bool(value)
    }
}

impl<A: HostAdapter> From<Vec<Child<A>>> for Child<A> {
    fn from(value: Vec<Child<A>>) -> Self {
        Child::List(value)
    }
}

// =============================================================================
// Narrowing
// =============================================================================

/// A child collapsed to one of {absent, string, element}.
pub enum Narrowed<A: HostAdapter> {
    None,
    Text(String),
    Element(Element<A>),
}

impl<A: HostAdapter> Narrowed<A> {
    /// The key of the narrowed child, if it is a keyed element.
    pub fn key(&self) -> Option<&Key> {
        match self {
            Narrowed::Element(el) => el.key.as_ref(),
            _ => None,
        }
    }
}

impl<A: HostAdapter> fmt::Debug for Narrowed<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Narrowed::None => write!(f, "None"),
            Narrowed::Text(s) => write!(f, "Text({s:?})"),
            Narrowed::Element(el) => write!(f, "{el:?}"),
        }
    }
}

/// Collapse an arbitrary child value.
///
/// Absent and booleans map to absent, numbers to their decimal string,
/// nested lists to an implicit `Fragment` element (preserving flattening
/// while giving the list a stable identity). This is a pure transform.
pub fn narrow<A: HostAdapter>(child: Child<A>) -> Narrowed<A> {
    match child {
        Child::None | Child::Bool(_) => Narrowed::None,
        Child::Int(n) => Narrowed::Text(n.to_string()),
        Child::Float(x) => Narrowed::Text(x.to_string()),
        Child::Text(s) => Narrowed::Text(s),
        Child::Element(el) => Narrowed::Element(el),
        Child::List(list) => Narrowed::Element(Element::fragment().children(list)),
    }
}

// =============================================================================
// Tests
// =============================================================================
