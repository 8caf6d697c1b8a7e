//! Shared test adapter: host nodes are counters, every adapter call is
//! recorded in an operation log the tests assert against.

use std::cell::RefCell;
use std::rc::Rc;

use crate::adapter::{HostAdapter, ValueAtom};
use crate::element::Props;
use crate::error::Result;

/// One recorded adapter call.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Op {
    Create {
        tag: String,
        node: u32,
    },
    Patch {
        tag: String,
        node: u32,
        attrs: Vec<(String, String)>,
    },
    Arrange {
        tag: Option<String>,
        node: u32,
        children: Vec<String>,
    },
    Remove {
        tag: String,
        node: u32,
    },
    Parse {
        text: String,
    },
}

fn render_atom(atom: &ValueAtom<u32>) -> String {
    match atom {
        ValueAtom::Text(text) => format!("{text:?}"),
        ValueAtom::Node(node) => format!("#{node}"),
    }
}

/// Counter-backed adapter. Node ids start at 1; tests use large root
/// ids so they never collide with created nodes. The `pre` tag derives
/// a scope, and scoped text is escaped by bracketing, so scope
/// propagation is observable in the log.
pub(crate) struct MockAdapter {
    next: u32,
    pub(crate) ops: Rc<RefCell<Vec<Op>>>,
}

impl MockAdapter {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            ops: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl HostAdapter for MockAdapter {
    type Node = u32;
    type Scope = String;

    fn create(&mut self, tag: &str, _props: &Props<Self>, _scope: Option<&String>) -> Result<u32> {
        let node = self.next;
        self.next += 1;
        self.ops.borrow_mut().push(Op::Create {
            tag: tag.to_string(),
            node,
        });
        Ok(node)
    }

    fn patch(
        &mut self,
        tag: &str,
        node: &u32,
        props: &Props<Self>,
        _scope: Option<&String>,
    ) -> Result<()> {
        let attrs = props
            .attrs
            .iter()
            .map(|(name, value)| (name.clone(), format!("{value:?}")))
            .collect();
        self.ops.borrow_mut().push(Op::Patch {
            tag: tag.to_string(),
            node: *node,
            attrs,
        });
        Ok(())
    }

    fn arrange(
        &mut self,
        tag: Option<&str>,
        node: &u32,
        children: &[ValueAtom<u32>],
    ) -> Result<()> {
        self.ops.borrow_mut().push(Op::Arrange {
            tag: tag.map(str::to_string),
            node: *node,
            children: children.iter().map(render_atom).collect(),
        });
        Ok(())
    }

    fn remove(&mut self, tag: &str, node: &u32) -> Result<()> {
        self.ops.borrow_mut().push(Op::Remove {
            tag: tag.to_string(),
            node: *node,
        });
        Ok(())
    }

    fn parse(&mut self, text: &str, _scope: Option<&String>) -> Result<ValueAtom<u32>> {
        self.ops.borrow_mut().push(Op::Parse {
            text: text.to_string(),
        });
        Ok(ValueAtom::Text(format!("raw:{text}")))
    }

    fn scope(
        &mut self,
        tag: &str,
        _props: &Props<Self>,
        parent: Option<&String>,
    ) -> Option<String> {
        if tag == "pre" {
            Some("pre".to_string())
        } else {
            parent.cloned()
        }
    }

    fn escape(&self, text: &str, scope: Option<&String>) -> String {
        match scope {
            Some(_) => format!("[{text}]"),
            None => text.to_string(),
        }
    }
}
