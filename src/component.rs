//! Component body kinds and the driver abstraction.
//!
//! A component body is one of four execution kinds, fixed when its
//! [`ComponentSpec`] is constructed:
//!
//! - `Function` - a one-shot synchronous function of props.
//! - `AsyncFunction` - a function returning a future of a child.
//! - `Generator` - a stateful driver resumed once per step.
//! - `AsyncGenerator` - a stateful driver whose resumption is awaited.
//!
//! Generator-style bodies implement [`SyncComponent`] / [`AsyncComponent`]:
//! the controller delivers fresh props (or an injected error, or the
//! finish signal) through `resume`, and the body answers with a
//! [`Flow`] - yield a child and stay live, or complete with a final
//! child. A driver that answers the finish signal with another yield is
//! violating the protocol and the renderer treats that as fatal.

use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::adapter::HostAdapter;
use crate::controller::Context;
use crate::element::{Child, Props};
use crate::error::{RenderError, Result};

// =============================================================================
// Resumption / Flow
// =============================================================================

/// What a driver receives when the controller resumes it.
pub enum Resumption<A: HostAdapter> {
    /// Fresh props for the next iteration.
    Props(Props<A>),
    /// An error raised while committing the component's own children,
    /// delivered back so the body can recover or rethrow. Only sent to
    /// bodies that report `handles_errors()`.
    Error(RenderError),
    /// Graceful-completion request issued at unmount.
    Finish,
}

/// What one iteration of a component body produces.
pub enum Flow<A: HostAdapter> {
    /// The body yielded a child and remains live.
    Continue(Child<A>),
    /// The body is done; its final child stays rendered.
    Complete(Child<A>),
}

impl<A: HostAdapter> Flow<A> {
    pub fn child(self) -> Child<A> {
        match self {
            Flow::Continue(child) | Flow::Complete(child) => child,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Flow::Complete(_))
    }
}

// =============================================================================
// Driver Traits
// =============================================================================

/// A synchronous generator-style component body.
pub trait SyncComponent<A: HostAdapter> {
    fn resume(&mut self, ctx: Context<A>, input: Resumption<A>) -> Result<Flow<A>>;

    /// Whether errors raised while committing this component's children
    /// should be injected back via [`Resumption::Error`].
    fn handles_errors(&self) -> bool {
        false
    }
}

/// An asynchronous generator-style component body.
///
/// `resume` is called synchronously and hands back a future; the body
/// moves whatever state it needs into that future. The controller never
/// resumes an async body while a previous resumption is still in flight.
pub trait AsyncComponent<A: HostAdapter> {
    fn resume(
        &mut self,
        ctx: Context<A>,
        input: Resumption<A>,
    ) -> LocalBoxFuture<'static, Result<Flow<A>>>;

    fn handles_errors(&self) -> bool {
        false
    }
}

/// Wrap a closure as a [`SyncComponent`] driver.
pub fn gen_fn<A, F>(f: F) -> Box<dyn SyncComponent<A>>
where
    A: HostAdapter,
    F: FnMut(Context<A>, Resumption<A>) -> Result<Flow<A>> + 'static,
{
    struct Wrapper<F>(F, bool);
    impl<A, F> SyncComponent<A> for Wrapper<F>
    where
        A: HostAdapter,
        F: FnMut(Context<A>, Resumption<A>) -> Result<Flow<A>> + 'static,
    {
        fn resume(&mut self, ctx: Context<A>, input: Resumption<A>) -> Result<Flow<A>> {
            (self.0)(ctx, input)
        }

        fn handles_errors(&self) -> bool {
            self.1
        }
    }
    Box::new(Wrapper(f, false))
}

/// Wrap a closure as a [`SyncComponent`] that catches child-commit errors.
pub fn catching_gen_fn<A, F>(f: F) -> Box<dyn SyncComponent<A>>
where
    A: HostAdapter,
    F: FnMut(Context<A>, Resumption<A>) -> Result<Flow<A>> + 'static,
{
    struct Wrapper<F>(F);
    impl<A, F> SyncComponent<A> for Wrapper<F>
    where
        A: HostAdapter,
        F: FnMut(Context<A>, Resumption<A>) -> Result<Flow<A>> + 'static,
    {
        fn resume(&mut self, ctx: Context<A>, input: Resumption<A>) -> Result<Flow<A>> {
            (self.0)(ctx, input)
        }

        fn handles_errors(&self) -> bool {
            true
        }
    }
    Box::new(Wrapper(f))
}

/// Wrap a closure as an [`AsyncComponent`] driver.
pub fn async_gen_fn<A, F>(f: F) -> Box<dyn AsyncComponent<A>>
where
    A: HostAdapter,
    F: FnMut(Context<A>, Resumption<A>) -> LocalBoxFuture<'static, Result<Flow<A>>> + 'static,
{
    struct Wrapper<F>(F);
    impl<A, F> AsyncComponent<A> for Wrapper<F>
    where
        A: HostAdapter,
        F: FnMut(Context<A>, Resumption<A>) -> LocalBoxFuture<'static, Result<Flow<A>>> + 'static,
    {
        fn resume(
            &mut self,
            ctx: Context<A>,
            input: Resumption<A>,
        ) -> LocalBoxFuture<'static, Result<Flow<A>>> {
            (self.0)(ctx, input)
        }
    }
    Box::new(Wrapper(f))
}

// =============================================================================
// Component Spec
// =============================================================================

pub type FnBody<A> = Rc<dyn Fn(Context<A>, &Props<A>) -> Result<Child<A>>>;
pub type AsyncFnBody<A> =
    Rc<dyn Fn(Context<A>, Props<A>) -> LocalBoxFuture<'static, Result<Child<A>>>>;
pub type GenFactory<A> = Rc<dyn Fn() -> Box<dyn SyncComponent<A>>>;
pub type AsyncGenFactory<A> = Rc<dyn Fn() -> Box<dyn AsyncComponent<A>>>;

/// The execution kind of a component body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    Function,
    AsyncFunction,
    Generator,
    AsyncGenerator,
}

enum BodyDef<A: HostAdapter> {
    Function(FnBody<A>),
    AsyncFunction(AsyncFnBody<A>),
    Generator(GenFactory<A>),
    AsyncGenerator(AsyncGenFactory<A>),
}

/// A named, shareable component definition.
///
/// Tag identity for diffing is the `Rc` pointer: two elements share a
/// retained node only when they reference the same spec.
pub struct ComponentSpec<A: HostAdapter> {
    name: String,
    body: BodyDef<A>,
}

impl<A: HostAdapter> ComponentSpec<A> {
    /// A plain function component. Never finishes on its own; it is
    /// re-invoked with fresh props for every step.
    pub fn function(
        name: impl Into<String>,
        f: impl Fn(Context<A>, &Props<A>) -> Result<Child<A>> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            body: BodyDef::Function(Rc::new(f)),
        })
    }

    /// A component whose body returns a future of a child.
    pub fn async_function(
        name: impl Into<String>,
        f: impl Fn(Context<A>, Props<A>) -> LocalBoxFuture<'static, Result<Child<A>>> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            body: BodyDef::AsyncFunction(Rc::new(f)),
        })
    }

    /// A generator component; `factory` builds one driver per mount.
    pub fn generator(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn SyncComponent<A>> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            body: BodyDef::Generator(Rc::new(factory)),
        })
    }

    /// An async generator component; `factory` builds one driver per mount.
    pub fn async_generator(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn AsyncComponent<A>> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            body: BodyDef::AsyncGenerator(Rc::new(factory)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BodyKind {
        match &self.body {
            BodyDef::Function(_) => BodyKind::Function,
            BodyDef::AsyncFunction(_) => BodyKind::AsyncFunction,
            BodyDef::Generator(_) => BodyKind::Generator,
            BodyDef::AsyncGenerator(_) => BodyKind::AsyncGenerator,
        }
    }

    /// Instantiate the body for one mounted element.
    pub(crate) fn instantiate(&self) -> Body<A> {
        match &self.body {
            BodyDef::Function(f) => Body::Function(f.clone()),
            BodyDef::AsyncFunction(f) => Body::AsyncFunction(f.clone()),
            BodyDef::Generator(factory) => Body::Generator(factory()),
            BodyDef::AsyncGenerator(factory) => Body::AsyncGenerator(factory()),
        }
    }
}

impl<A: HostAdapter> fmt::Debug for ComponentSpec<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentSpec({}, {:?})", self.name, self.kind())
    }
}

/// A live body instance owned by one controller.
pub(crate) enum Body<A: HostAdapter> {
    Function(FnBody<A>),
    AsyncFunction(AsyncFnBody<A>),
    Generator(Box<dyn SyncComponent<A>>),
    AsyncGenerator(Box<dyn AsyncComponent<A>>),
}

impl<A: HostAdapter> Body<A> {
    pub(crate) fn handles_errors(&self) -> bool {
        match self {
            Body::Generator(driver) => driver.handles_errors(),
            Body::AsyncGenerator(driver) => driver.handles_errors(),
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockAdapter;

    #[test]
    fn test_spec_kinds() {
        let f = ComponentSpec::<MockAdapter>::function("F", |_, _| Ok(Child::None));
        assert_eq!(f.kind(), BodyKind::Function);
        assert_eq!(f.name(), "F");

        let g = ComponentSpec::<MockAdapter>::generator("G", || {
            gen_fn(|_, _| Ok(Flow::Complete(Child::None)))
        });
        assert_eq!(g.kind(), BodyKind::Generator);
    }

    #[test]
    fn test_instantiate_builds_fresh_driver_state() {
        let spec = ComponentSpec::<MockAdapter>::generator("Count", || {
            let mut count = 0i64;
            gen_fn(move |_, _| {
                count += 1;
                Ok(Flow::Continue(Child::Int(count)))
            })
        });

        // Two instances must not share the closure's counter.
        let mut a = spec.instantiate();
        let mut b = spec.instantiate();
        let (Body::Generator(a), Body::Generator(b)) = (&mut a, &mut b) else {
            panic!("expected generator bodies");
        };
        let ctx = Context::detached();
        let first = a
            .resume(ctx.clone(), Resumption::Props(Props::new()))
            .unwrap();
        let second = b.resume(ctx, Resumption::Props(Props::new())).unwrap();
        assert!(matches!(first, Flow::Continue(Child::Int(1))));
        assert!(matches!(second, Flow::Continue(Child::Int(1))));
    }

    #[test]
    fn test_catching_wrapper_reports_capability() {
        let caught = catching_gen_fn::<MockAdapter, _>(|_, _| Ok(Flow::Complete(Child::None)));
        assert!(caught.handles_errors());
        let plain = gen_fn::<MockAdapter, _>(|_, _| Ok(Flow::Complete(Child::None)));
        assert!(!plain.handles_errors());
    }
}
