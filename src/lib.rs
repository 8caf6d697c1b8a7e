//! # cinder-ui
//!
//! Host-agnostic declarative UI composition engine.
//!
//! Applications describe a tree of [`Element`]s; the [`Renderer`] diffs
//! each description against its retained state and drives a
//! [`HostAdapter`] (create/patch/arrange/remove) to keep a concrete
//! host tree in sync. The engine itself never touches a host value.
//!
//! ## Architecture
//!
//! ```text
//! Element tree → diff (keyed/positional alignment) → commit → HostAdapter
//!                     ↑
//!            component controllers (sync/async bodies, refresh, events)
//! ```
//!
//! Components come in four execution kinds (function, async function,
//! generator, async generator); stateful kinds implement a driver trait
//! resumed once per step. Scheduling is single-threaded and
//! cooperative: asynchronous steps run on an internal executor pumped
//! by [`Renderer::turn`], and at most one step per component is in
//! flight, with newer updates coalesced behind it.
//!
//! ## Modules
//!
//! - [`element`] - elements, tags, props, keys, child narrowing
//! - [`component`] - component specs and the body driver traits
//! - [`controller`] - per-component runtime state and the [`Context`] handle
//! - [`renderer`] - retained tree, reconciliation, commit machinery
//! - [`adapter`] - the [`HostAdapter`] contract and committed values
//! - [`events`] - event objects and listener registries
//! - [`error`] - the error taxonomy

pub mod adapter;
pub mod component;
pub mod controller;
pub mod element;
pub mod error;
pub mod events;
pub mod renderer;

#[cfg(test)]
pub(crate) mod testutil;

pub use adapter::{HostAdapter, Value, ValueAtom, merge_text_runs};

pub use component::{
    AsyncComponent, BodyKind, ComponentSpec, Flow, Resumption, SyncComponent, async_gen_fn,
    catching_gen_fn, gen_fn,
};

pub use controller::Context;

pub use element::{Child, Element, Key, Narrowed, PropValue, Props, Tag, narrow};

pub use error::{RenderError, Result};

pub use events::{Event, EventPhase, Listener, ListenerFn, ListenerOptions};

pub use renderer::{NodeId, RenderOutcome, Renderer};
