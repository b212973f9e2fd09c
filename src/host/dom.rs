// src/host/dom.rs
// Document abstraction and the in-memory VirtualDom used by headless hosts

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Marker attribute the wrapper template puts on the app host element
pub const HOST_MARKER: &str = "data-portal-app-host";
/// Marker attribute the wrapper template puts on the title element
pub const TITLE_MARKER: &str = "data-portal-app-title";

/// Opaque handle to an element owned by a [`Dom`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "el#{}", self.0)
    }
}

/// Kind of a head resource element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Script,
    Style,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Script => "script",
            ResourceKind::Style => "link",
        }
    }
}

/// Elements materialized from an app wrapper template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperElements {
    pub wrapper: ElementId,
    pub host: ElementId,
    pub title: Option<ElementId>,
}

/// The subset of the browser document the runtime manipulates.
///
/// Implementations must tolerate handles of detached elements: operations on
/// them are no-ops and queries return `None`/`false`.
pub trait Dom: Send + Sync {
    fn body(&self) -> ElementId;
    fn head(&self) -> ElementId;

    /// Look up an attached element by its `id` attribute
    fn element_by_id(&self, id: &str) -> Option<ElementId>;

    /// Materialize rendered wrapper HTML into a detached element tree.
    /// The host element is the one carrying [`HOST_MARKER`], the title the
    /// one carrying [`TITLE_MARKER`] (optional in custom templates).
    fn create_app_wrapper(&self, html: &str, dom_id: &str) -> WrapperElements;

    /// Create a detached `<script>` or `<link rel="stylesheet">` element
    fn create_resource_element(&self, kind: ResourceKind, url: &str) -> ElementId;

    /// Insert `child` under `parent` at `position` (clamped into
    /// `[0, child_count]`, appended when `None`). Attached children move.
    fn insert_child(&self, parent: ElementId, child: ElementId, position: Option<usize>);

    /// Detach an element (and its subtree) from the document
    fn remove(&self, element: ElementId);

    fn parent_of(&self, element: ElementId) -> Option<ElementId>;
    fn index_in_parent(&self, element: ElementId) -> Option<usize>;
    fn child_count(&self, parent: ElementId) -> usize;

    fn set_visible(&self, element: ElementId, visible: bool);
    fn is_visible(&self, element: ElementId) -> bool;

    /// Replace the content of an element with raw HTML
    fn set_inner_html(&self, element: ElementId, html: &str);
    fn set_text(&self, element: ElementId, text: &str);

    fn add_class(&self, element: ElementId, class: &str);
    fn remove_class(&self, element: ElementId, class: &str);
    fn has_class(&self, element: ElementId, class: &str) -> bool;
}

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    dom_id: Option<String>,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    visible: bool,
    classes: BTreeSet<String>,
    inner_html: String,
    text: String,
    url: Option<String>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            dom_id: None,
            parent: None,
            children: Vec::new(),
            visible: true,
            classes: BTreeSet::new(),
            inner_html: String::new(),
            text: String::new(),
            url: None,
        }
    }
}

struct Tree {
    next_id: u64,
    nodes: HashMap<ElementId, Node>,
    document: ElementId,
    head: ElementId,
    body: ElementId,
}

impl Tree {
    fn alloc(&mut self, node: Node) -> ElementId {
        let id = ElementId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    fn detach(&mut self, element: ElementId) {
        let parent = self.nodes.get(&element).and_then(|n| n.parent);
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != element);
            }
        }
        if let Some(node) = self.nodes.get_mut(&element) {
            node.parent = None;
        }
    }

    fn is_attached(&self, element: ElementId) -> bool {
        let mut current = Some(element);
        while let Some(id) = current {
            if id == self.document {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn attach(&mut self, parent: ElementId, child: ElementId) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
    }
}

/// In-memory document tree.
///
/// Starts with `<html><head/><body/></html>`. Used as the document of
/// headless portal hosts and as the test double for the browser DOM.
pub struct VirtualDom {
    tree: RwLock<Tree>,
}

impl Default for VirtualDom {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDom {
    pub fn new() -> Self {
        let mut tree = Tree {
            next_id: 1,
            nodes: HashMap::new(),
            document: ElementId(0),
            head: ElementId(0),
            body: ElementId(0),
        };
        let document = tree.alloc(Node::new("html"));
        let head = tree.alloc(Node::new("head"));
        let body = tree.alloc(Node::new("body"));
        tree.attach(document, head);
        tree.attach(document, body);
        if let Some(doc) = tree.nodes.get_mut(&document) {
            doc.children = vec![head, body];
        }
        tree.document = document;
        tree.head = head;
        tree.body = body;
        Self {
            tree: RwLock::new(tree),
        }
    }

    /// Append a `<div id=...>` to `parent` (the body when `None`)
    pub fn create_element(&self, dom_id: &str, parent: Option<ElementId>) -> ElementId {
        let mut node = Node::new("div");
        node.dom_id = Some(dom_id.to_string());
        let id = self.tree.write().alloc(node);
        let parent = parent.unwrap_or_else(|| self.body());
        self.insert_child(parent, id, None);
        id
    }

    pub fn children(&self, parent: ElementId) -> Vec<ElementId> {
        self.tree
            .read()
            .nodes
            .get(&parent)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn is_attached(&self, element: ElementId) -> bool {
        self.tree.read().is_attached(element)
    }

    pub fn inner_html(&self, element: ElementId) -> Option<String> {
        self.tree.read().nodes.get(&element).map(|n| n.inner_html.clone())
    }

    pub fn text(&self, element: ElementId) -> Option<String> {
        self.tree.read().nodes.get(&element).map(|n| n.text.clone())
    }

    pub fn dom_id(&self, element: ElementId) -> Option<String> {
        self.tree.read().nodes.get(&element).and_then(|n| n.dom_id.clone())
    }

    /// URLs of the resource elements currently attached to the head
    pub fn head_resources(&self, kind: ResourceKind) -> Vec<String> {
        let tree = self.tree.read();
        let Some(head) = tree.nodes.get(&tree.head) else {
            return Vec::new();
        };
        head.children
            .iter()
            .filter_map(|c| tree.nodes.get(c))
            .filter(|n| n.tag == kind.as_str())
            .filter_map(|n| n.url.clone())
            .collect()
    }
}

impl Dom for VirtualDom {
    fn body(&self) -> ElementId {
        self.tree.read().body
    }

    fn head(&self) -> ElementId {
        self.tree.read().head
    }

    fn element_by_id(&self, id: &str) -> Option<ElementId> {
        let tree = self.tree.read();
        tree.nodes
            .iter()
            .filter(|(_, n)| n.dom_id.as_deref() == Some(id))
            .map(|(el, _)| *el)
            .find(|el| tree.is_attached(*el))
    }

    fn create_app_wrapper(&self, html: &str, dom_id: &str) -> WrapperElements {
        let mut tree = self.tree.write();

        let mut wrapper_node = Node::new("div");
        wrapper_node.dom_id = Some(dom_id.to_string());
        wrapper_node.inner_html = html.to_string();
        let wrapper = tree.alloc(wrapper_node);

        let mut children = Vec::new();
        let title = if html.contains(TITLE_MARKER) {
            let title = tree.alloc(Node::new("div"));
            tree.attach(wrapper, title);
            children.push(title);
            Some(title)
        } else {
            None
        };
        let host = tree.alloc(Node::new("div"));
        tree.attach(wrapper, host);
        children.push(host);

        if let Some(node) = tree.nodes.get_mut(&wrapper) {
            node.children = children;
        }

        WrapperElements {
            wrapper,
            host,
            title,
        }
    }

    fn create_resource_element(&self, kind: ResourceKind, url: &str) -> ElementId {
        let mut node = Node::new(kind.as_str());
        node.url = Some(url.to_string());
        self.tree.write().alloc(node)
    }

    fn insert_child(&self, parent: ElementId, child: ElementId, position: Option<usize>) {
        let mut tree = self.tree.write();
        if !tree.nodes.contains_key(&parent) || !tree.nodes.contains_key(&child) {
            return;
        }
        tree.detach(child);
        let Some(parent_node) = tree.nodes.get_mut(&parent) else {
            return;
        };
        let count = parent_node.children.len();
        let index = position.map(|p| p.min(count)).unwrap_or(count);
        parent_node.children.insert(index, child);
        tree.attach(parent, child);
    }

    fn remove(&self, element: ElementId) {
        self.tree.write().detach(element);
    }

    fn parent_of(&self, element: ElementId) -> Option<ElementId> {
        self.tree.read().nodes.get(&element).and_then(|n| n.parent)
    }

    fn index_in_parent(&self, element: ElementId) -> Option<usize> {
        let tree = self.tree.read();
        let parent = tree.nodes.get(&element)?.parent?;
        tree.nodes
            .get(&parent)?
            .children
            .iter()
            .position(|c| *c == element)
    }

    fn child_count(&self, parent: ElementId) -> usize {
        self.tree
            .read()
            .nodes
            .get(&parent)
            .map(|n| n.children.len())
            .unwrap_or(0)
    }

    fn set_visible(&self, element: ElementId, visible: bool) {
        if let Some(node) = self.tree.write().nodes.get_mut(&element) {
            node.visible = visible;
        }
    }

    fn is_visible(&self, element: ElementId) -> bool {
        self.tree
            .read()
            .nodes
            .get(&element)
            .map(|n| n.visible)
            .unwrap_or(false)
    }

    fn set_inner_html(&self, element: ElementId, html: &str) {
        let mut tree = self.tree.write();
        let children = match tree.nodes.get_mut(&element) {
            Some(node) => {
                node.inner_html = html.to_string();
                std::mem::take(&mut node.children)
            }
            None => return,
        };
        for child in children {
            if let Some(node) = tree.nodes.get_mut(&child) {
                node.parent = None;
            }
        }
    }

    fn set_text(&self, element: ElementId, text: &str) {
        if let Some(node) = self.tree.write().nodes.get_mut(&element) {
            node.text = text.to_string();
        }
    }

    fn add_class(&self, element: ElementId, class: &str) {
        if let Some(node) = self.tree.write().nodes.get_mut(&element) {
            node.classes.insert(class.to_string());
        }
    }

    fn remove_class(&self, element: ElementId, class: &str) {
        if let Some(node) = self.tree.write().nodes.get_mut(&element) {
            node.classes.remove(class);
        }
    }

    fn has_class(&self, element: ElementId, class: &str) -> bool {
        self.tree
            .read()
            .nodes
            .get(&element)
            .map(|n| n.classes.contains(class))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_position_is_clamped() {
        let dom = VirtualDom::new();
        let area = dom.create_element("area", None);
        let a = dom.create_element("a", Some(area));
        let b = dom.create_element("b", Some(area));
        let c = dom.create_element("c", None);

        dom.insert_child(area, c, Some(99));
        assert_eq!(dom.children(area), vec![a, b, c]);

        dom.insert_child(area, c, Some(0));
        assert_eq!(dom.children(area), vec![c, a, b]);
        assert_eq!(dom.index_in_parent(b), Some(2));
    }

    #[test]
    fn test_element_by_id_ignores_detached() {
        let dom = VirtualDom::new();
        let area = dom.create_element("area", None);
        assert_eq!(dom.element_by_id("area"), Some(area));

        dom.remove(area);
        assert_eq!(dom.element_by_id("area"), None);
        assert!(!dom.is_attached(area));
    }

    #[test]
    fn test_wrapper_title_is_optional() {
        let dom = VirtualDom::new();
        let with_title =
            dom.create_app_wrapper(&format!("<div {TITLE_MARKER}></div><div {HOST_MARKER}></div>"), "w1");
        assert!(with_title.title.is_some());
        assert_eq!(dom.parent_of(with_title.host), Some(with_title.wrapper));

        let without_title = dom.create_app_wrapper(&format!("<div {HOST_MARKER}></div>"), "w2");
        assert!(without_title.title.is_none());
    }

    #[test]
    fn test_inner_html_detaches_children() {
        let dom = VirtualDom::new();
        let area = dom.create_element("area", None);
        let child = dom.create_element("child", Some(area));

        dom.set_inner_html(area, "<p>error</p>");
        assert_eq!(dom.child_count(area), 0);
        assert!(!dom.is_attached(child));
        assert_eq!(dom.inner_html(area).as_deref(), Some("<p>error</p>"));
    }

    #[test]
    fn test_head_resources() {
        let dom = VirtualDom::new();
        let script = dom.create_resource_element(ResourceKind::Script, "/a.js");
        let style = dom.create_resource_element(ResourceKind::Style, "/a.css");
        dom.insert_child(dom.head(), script, None);
        dom.insert_child(dom.head(), style, None);

        assert_eq!(dom.head_resources(ResourceKind::Script), vec!["/a.js"]);
        assert_eq!(dom.head_resources(ResourceKind::Style), vec!["/a.css"]);
    }
}
