//! Render to HTML strings: a minimal adapter whose host nodes are ids
//! into an in-adapter slab, serialized on demand.
//!
//! Run with `cargo run --example strings`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use cinder_ui::{
    Child, ComponentSpec, Context, Element, Flow, HostAdapter, Props, PropValue, Renderer,
    Resumption, Result, Value, ValueAtom, gen_fn,
};

const VOID_TAGS: &[&str] = &["br", "hr", "img", "input", "meta"];

#[derive(Default)]
struct HtmlNode {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<ValueAtom<u32>>,
}

/// Adapter whose committed tree serializes to an HTML string.
struct HtmlAdapter {
    next: u32,
    nodes: HashMap<u32, HtmlNode>,
}

impl HtmlAdapter {
    fn new() -> Self {
        // Id 0 is reserved as the render root.
        let mut nodes = HashMap::new();
        nodes.insert(0, HtmlNode::default());
        Self { next: 1, nodes }
    }

    fn to_html(&self, id: u32) -> String {
        let Some(node) = self.nodes.get(&id) else {
            return String::new();
        };
        let inner: String = node
            .children
            .iter()
            .map(|atom| match atom {
                ValueAtom::Text(text) => text.clone(),
                ValueAtom::Node(child) => self.to_html(*child),
            })
            .collect();
        if node.tag.is_empty() {
            return inner;
        }
        let attrs: String = node
            .attrs
            .iter()
            .map(|(name, value)| format!(" {name}=\"{value}\""))
            .collect();
        if VOID_TAGS.contains(&node.tag.as_str()) {
            format!("<{}{attrs}>", node.tag)
        } else {
            format!("<{}{attrs}>{inner}</{}>", node.tag, node.tag)
        }
    }
}

fn attr_text(value: &PropValue) -> String {
    match value {
        PropValue::Str(text) => text.clone(),
        PropValue::Bool(b) => b.to_string(),
        PropValue::Int(n) => n.to_string(),
        PropValue::Float(x) => x.to_string(),
        other => format!("{other:?}"),
    }
}

impl HostAdapter for HtmlAdapter {
    type Node = u32;
    type Scope = ();

    fn create(&mut self, tag: &str, _props: &Props<Self>, _scope: Option<&()>) -> Result<u32> {
        let id = self.next;
        self.next += 1;
        self.nodes.insert(
            id,
            HtmlNode {
                tag: tag.to_string(),
                ..HtmlNode::default()
            },
        );
        Ok(id)
    }

    fn patch(
        &mut self,
        _tag: &str,
        node: &u32,
        props: &Props<Self>,
        _scope: Option<&()>,
    ) -> Result<()> {
        if let Some(record) = self.nodes.get_mut(node) {
            record.attrs = props
                .attrs
                .iter()
                .map(|(name, value)| (name.clone(), attr_text(value)))
                .collect();
        }
        Ok(())
    }

    fn arrange(&mut self, _tag: Option<&str>, node: &u32, children: &[ValueAtom<u32>]) -> Result<()> {
        if let Some(record) = self.nodes.get_mut(node) {
            record.children = children.to_vec();
        }
        Ok(())
    }

    fn remove(&mut self, _tag: &str, node: &u32) -> Result<()> {
        self.nodes.remove(node);
        Ok(())
    }

    fn parse(&mut self, text: &str, _scope: Option<&()>) -> Result<ValueAtom<u32>> {
        // Raw markup passes through unescaped.
        Ok(ValueAtom::Text(text.to_string()))
    }

    fn scope(&mut self, _tag: &str, _props: &Props<Self>, parent: Option<&()>) -> Option<()> {
        parent.copied()
    }

    fn escape(&self, text: &str, _scope: Option<&()>) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }
}

fn main() {
    let counter_ctx: Rc<RefCell<Option<Context<HtmlAdapter>>>> = Rc::new(RefCell::new(None));

    let sink = counter_ctx.clone();
    let counter = ComponentSpec::generator("Counter", move || {
        let sink = sink.clone();
        let mut count = 0u32;
        gen_fn(move |ctx, input| match input {
            Resumption::Finish => Ok(Flow::Complete(Child::None)),
            _ => {
                *sink.borrow_mut() = Some(ctx.clone());
                count += 1;
                Ok(Flow::Continue(Child::Element(
                    Element::host("p").child(format!("clicked {count} time(s)")),
                )))
            }
        })
    });

    let app = Element::host("div")
        .attr("class", "app")
        .child(Element::host("h1").child("cinder <demo>"))
        .child(Element::component(counter))
        .child(Element::raw("<hr>"));

    let mut renderer = Renderer::new(HtmlAdapter::new());
    match renderer.render(app, 0) {
        Ok(_) => println!("{}", renderer.with_adapter(|a| a.to_html(0))),
        Err(err) => eprintln!("render failed: {err}"),
    }

    // A component-initiated refresh re-renders just the counter.
    if let Some(ctx) = counter_ctx.borrow().clone()
        && let Err(err) = ctx.refresh()
    {
        eprintln!("refresh failed: {err}");
    }
    println!("{}", renderer.with_adapter(|a| a.to_html(0)));

    // Tearing the root down leaves only the (empty) root record.
    if let Err(err) = renderer.render(Child::None, 0) {
        eprintln!("teardown failed: {err}");
    }
    let value: Value<u32> = renderer.read_root(&0).unwrap_or(Value::None);
    println!("after teardown: {value:?}, html = {:?}", renderer.with_adapter(|a| a.to_html(0)));
}
