//! Minimal virtual DOM for server-side rendering.
//!
//! The embedded application mutates `window`, `document`, `location`, and
//! `history` as ambient singletons. Inside a worker those become this
//! per-instance state bundle: a flat arena of nodes rooted at an `html`
//! element, plus a [`Location`] mock. The DOM only needs to support what
//! the interop bridge exposes and serialize back to HTML.

pub type NodeId = u32;

/// The `location` mock visible to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Host and port, e.g. `0.0.0.0:4100`.
    pub host: String,
    /// Request path, without the query string.
    pub path: String,
    /// Query string, without the leading `?`.
    pub search: String,
}

#[derive(Debug)]
enum NodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
        children: Vec<NodeId>,
    },
    Text(String),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
}

/// A document tree owned by exactly one worker.
#[derive(Debug)]
pub struct VirtualDom {
    nodes: Vec<Node>,
    html: NodeId,
    body: NodeId,
    /// Location mock, updated on navigation.
    pub location: Location,
}

impl VirtualDom {
    /// Create a document (`<html><head></head><body></body></html>`)
    /// pointed at the given route.
    pub fn new(server_port: u16, path: &str, search: &str) -> Self {
        let mut dom = Self {
            nodes: Vec::new(),
            html: 0,
            body: 0,
            location: Location {
                host: format!("0.0.0.0:{server_port}"),
                path: path.to_owned(),
                search: search.to_owned(),
            },
        };
        let html = dom.create_element("html");
        let head = dom.create_element("head");
        let body = dom.create_element("body");
        dom.append_child(html, head);
        dom.append_child(html, body);
        dom.html = html;
        dom.body = body;
        dom
    }

    /// Point the location mock at a new route. The tree is left alone; the
    /// application re-renders by mutating it.
    pub fn navigate(&mut self, path: &str, search: &str) {
        self.location.path = path.to_owned();
        self.location.search = search.to_owned();
    }

    /// The `<body>` element.
    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Create a detached element node.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element {
            tag: tag.to_owned(),
            attributes: Vec::new(),
            children: Vec::new(),
        })
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_owned()))
    }

    /// Set an attribute, replacing any previous value. No-op on text nodes
    /// and unknown ids.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(NodeKind::Element { attributes, .. }) = self.kind_mut(node) {
            if let Some(slot) = attributes.iter_mut().find(|(key, _)| key == name) {
                slot.1 = value.to_owned();
            } else {
                attributes.push((name.to_owned(), value.to_owned()));
            }
        }
    }

    /// Remove an attribute if present.
    pub fn remove_attribute(&mut self, node: NodeId, name: &str) {
        if let Some(NodeKind::Element { attributes, .. }) = self.kind_mut(node) {
            attributes.retain(|(key, _)| key != name);
        }
    }

    /// Append `child` to `parent`, detaching it from any previous parent.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if self.node(parent).is_none() || self.node(child).is_none() || parent == child {
            return;
        }
        self.detach(child);
        if let Some(NodeKind::Element { children, .. }) = self.kind_mut(parent) {
            children.push(child);
        } else {
            return;
        }
        if let Some(node) = self.nodes.get_mut(child as usize) {
            node.parent = Some(parent);
        }
    }

    /// Remove `child` from `parent`. No-op when `child` is not a child of
    /// `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        let is_parent = self
            .node(child)
            .is_some_and(|node| node.parent == Some(parent));
        if !is_parent {
            return;
        }
        self.detach(child);
    }

    /// Replace the textual content of a node: the content of a text node,
    /// or all children of an element with a single new text node.
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        match self.kind_mut(node) {
            Some(NodeKind::Text(content)) => *content = text.to_owned(),
            Some(NodeKind::Element { .. }) => {
                let children: Vec<NodeId> = match self.kind_mut(node) {
                    Some(NodeKind::Element { children, .. }) => std::mem::take(children),
                    _ => return,
                };
                for child in children {
                    if let Some(entry) = self.nodes.get_mut(child as usize) {
                        entry.parent = None;
                    }
                }
                let text_node = self.create_text(text);
                self.append_child(node, text_node);
            }
            None => {}
        }
    }

    /// Serialize the document, starting at the `html` element.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_node(self.html, &mut out);
        out
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node { kind, parent: None });
        (self.nodes.len() - 1) as NodeId
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    fn kind_mut(&mut self, id: NodeId) -> Option<&mut NodeKind> {
        self.nodes.get_mut(id as usize).map(|node| &mut node.kind)
    }

    fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.node(child).and_then(|node| node.parent) else {
            return;
        };
        if let Some(NodeKind::Element { children, .. }) = self.kind_mut(parent) {
            children.retain(|&id| id != child);
        }
        if let Some(node) = self.nodes.get_mut(child as usize) {
            node.parent = None;
        }
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(content) => escape_into(content, false, out),
            NodeKind::Element {
                tag,
                attributes,
                children,
            } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    escape_into(value, true, out);
                    out.push('"');
                }
                out.push('>');
                for &child in children {
                    self.write_node(child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape_into(value: &str, attribute: bool, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let dom = VirtualDom::new(4100, "/", "");
        assert_eq!(dom.to_html(), "<html><head></head><body></body></html>");
        assert_eq!(dom.location.host, "0.0.0.0:4100");
    }

    #[test]
    fn test_build_and_serialize() {
        let mut dom = VirtualDom::new(4100, "/hello", "x=1");
        let div = dom.create_element("div");
        dom.set_attribute(div, "class", "app");
        let text = dom.create_text("hi there");
        dom.append_child(div, text);
        dom.append_child(dom.body(), div);

        assert_eq!(
            dom.to_html(),
            "<html><head></head><body><div class=\"app\">hi there</div></body></html>"
        );
    }

    #[test]
    fn test_attribute_replacement() {
        let mut dom = VirtualDom::new(4100, "/", "");
        let div = dom.create_element("div");
        dom.append_child(dom.body(), div);

        dom.set_attribute(div, "data-state", "old");
        dom.set_attribute(div, "data-state", "new");
        assert!(dom.to_html().contains("data-state=\"new\""));
        assert!(!dom.to_html().contains("old"));

        dom.remove_attribute(div, "data-state");
        assert!(dom.to_html().contains("<div></div>"));
    }

    #[test]
    fn test_append_moves_between_parents() {
        let mut dom = VirtualDom::new(4100, "/", "");
        let first = dom.create_element("ul");
        let second = dom.create_element("ol");
        let item = dom.create_element("li");
        dom.append_child(dom.body(), first);
        dom.append_child(dom.body(), second);

        dom.append_child(first, item);
        assert!(dom.to_html().contains("<ul><li></li></ul><ol></ol>"));

        dom.append_child(second, item);
        assert!(dom.to_html().contains("<ul></ul><ol><li></li></ol>"));
    }

    #[test]
    fn test_remove_child() {
        let mut dom = VirtualDom::new(4100, "/", "");
        let div = dom.create_element("div");
        dom.append_child(dom.body(), div);
        dom.remove_child(dom.body(), div);
        assert_eq!(dom.to_html(), "<html><head></head><body></body></html>");

        // Removing under the wrong parent is a no-op
        let span = dom.create_element("span");
        dom.append_child(dom.body(), span);
        dom.remove_child(div, span);
        assert!(dom.to_html().contains("<span></span>"));
    }

    #[test]
    fn test_set_text_on_element() {
        let mut dom = VirtualDom::new(4100, "/", "");
        let p = dom.create_element("p");
        dom.append_child(dom.body(), p);
        let old = dom.create_text("old");
        dom.append_child(p, old);

        dom.set_text(p, "fresh");
        assert!(dom.to_html().contains("<p>fresh</p>"));
    }

    #[test]
    fn test_escaping() {
        let mut dom = VirtualDom::new(4100, "/", "");
        let div = dom.create_element("div");
        dom.set_attribute(div, "title", "a\"b<c");
        let text = dom.create_text("1 < 2 & 3 > 2");
        dom.append_child(div, text);
        dom.append_child(dom.body(), div);

        let html = dom.to_html();
        assert!(html.contains("title=\"a&quot;b&lt;c\""));
        assert!(html.contains("1 &lt; 2 &amp; 3 &gt; 2"));
    }

    #[test]
    fn test_navigate_updates_location_only() {
        let mut dom = VirtualDom::new(4100, "/a", "x=1");
        let div = dom.create_element("div");
        dom.append_child(dom.body(), div);

        dom.navigate("/b", "y=2");
        assert_eq!(dom.location.path, "/b");
        assert_eq!(dom.location.search, "y=2");
        assert!(dom.to_html().contains("<div></div>"));
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let mut dom = VirtualDom::new(4100, "/", "");
        dom.set_attribute(999, "id", "x");
        dom.append_child(dom.body(), 999);
        dom.append_child(999, dom.body());
        assert_eq!(dom.to_html(), "<html><head></head><body></body></html>");
    }
}
