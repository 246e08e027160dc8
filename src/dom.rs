//! Host Document - the page surface the guard renders into and watches
//!
//! `Dom` is the narrow slice of a browser document the overlay renderer and
//! tamper watcher need. `MemoryDocument` implements it in-process, including
//! MutationObserver-style delivery of change records.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Handle to an element owned by a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Handle to a registered mutation observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// What a mutation record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Children were added to or removed from `target`
    ChildList,
    /// An attribute of `target` was written
    Attributes,
}

/// One observed change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    pub attribute_name: Option<String>,
}

impl MutationRecord {
    fn child_list(target: NodeId, added_nodes: Vec<NodeId>, removed_nodes: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            added_nodes,
            removed_nodes,
            attribute_name: None,
        }
    }

    fn attribute(target: NodeId, name: &str) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target,
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            attribute_name: Some(name.to_string()),
        }
    }
}

/// Which changes an observer wants to hear about
#[derive(Debug, Clone, Default)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: bool,
    pub subtree: bool,
    /// Restrict attribute records to these names (`None` = all attributes)
    pub attribute_filter: Option<Vec<String>>,
}

/// A live observer registration and its batch queue
pub struct MutationSubscription {
    pub id: ObserverId,
    pub records: mpsc::UnboundedReceiver<Vec<MutationRecord>>,
}

/// Document operation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("Cannot insert node {0:?} into its own subtree")]
    HierarchyRequest(NodeId),
}

/// Page operations used by the renderer and the watcher
pub trait Dom: Send + Sync {
    /// The document body (root of everything the guard touches)
    fn body(&self) -> NodeId;

    /// Find a connected element by its `id` attribute
    fn get_element_by_id(&self, id: &str) -> Option<NodeId>;

    fn element_id(&self, node: NodeId) -> Option<String>;

    fn create_element(&self, tag: &str) -> NodeId;

    fn set_element_id(&self, node: NodeId, id: &str) -> Result<(), DomError>;

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError>;

    /// Detach `node` from its parent. Detached nodes are left alone.
    fn remove(&self, node: NodeId) -> Result<(), DomError>;

    /// Whether `node` is attached under the body
    fn is_connected(&self, node: NodeId) -> bool;

    /// Inline style property, `None` when unset
    fn style(&self, node: NodeId, property: &str) -> Option<String>;

    /// Write one inline style property. An empty value clears it.
    fn set_style(&self, node: NodeId, property: &str, value: &str) -> Result<(), DomError>;

    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;

    /// Write an attribute. `style` replaces the whole inline declaration block.
    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError>;

    fn inner_html(&self, node: NodeId) -> Option<String>;

    /// Replace the node's markup, detaching its element children
    fn set_inner_html(&self, node: NodeId, markup: &str) -> Result<(), DomError>;

    fn observe(
        &self,
        target: NodeId,
        options: ObserveOptions,
    ) -> Result<MutationSubscription, DomError>;

    fn disconnect(&self, observer: ObserverId);
}

#[derive(Debug)]
struct Element {
    tag: String,
    attributes: BTreeMap<String, String>,
    style: Vec<(String, String)>,
    markup: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Element {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            style: Vec::new(),
            markup: String::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    fn css_text(&self) -> String {
        self.style
            .iter()
            .map(|(property, value)| format!("{}: {};", property, value))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn put_style(&mut self, property: &str, value: &str) {
        let property = property.trim().to_ascii_lowercase();
        let value = value.trim();

        if value.is_empty() {
            self.style.retain(|(p, _)| *p != property);
            return;
        }

        match self.style.iter_mut().find(|(p, _)| *p == property) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.style.push((property, value.to_string())),
        }
    }

    fn replace_style(&mut self, css_text: &str) {
        self.style.clear();
        for declaration in css_text.split(';') {
            if let Some((property, value)) = declaration.split_once(':') {
                self.put_style(property, value);
            }
        }
    }
}

struct Observer {
    id: ObserverId,
    target: NodeId,
    options: ObserveOptions,
    tx: mpsc::UnboundedSender<Vec<MutationRecord>>,
}

impl Observer {
    fn wants(&self, record: &MutationRecord) -> bool {
        match record.kind {
            MutationKind::ChildList => self.options.child_list,
            MutationKind::Attributes => {
                self.options.attributes
                    && match (&self.options.attribute_filter, &record.attribute_name) {
                        (Some(filter), Some(name)) => filter.iter().any(|f| f == name),
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
            }
        }
    }
}

struct DocumentInner {
    nodes: Vec<Element>,
    body: NodeId,
    observers: Vec<Observer>,
    next_observer: u64,
}

impl DocumentInner {
    fn element(&self, node: NodeId) -> Result<&Element, DomError> {
        self.nodes.get(node.0).ok_or(DomError::UnknownNode(node))
    }

    fn element_mut(&mut self, node: NodeId) -> Result<&mut Element, DomError> {
        self.nodes.get_mut(node.0).ok_or(DomError::UnknownNode(node))
    }

    /// `ancestor` is `node` or one of its parents
    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.nodes.get(current.0).and_then(|e| e.parent);
        }
        false
    }

    fn detach(&mut self, node: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get_mut(node.0)?.parent.take()?;
        if let Some(p) = self.nodes.get_mut(parent.0) {
            p.children.retain(|c| *c != node);
        }
        Some(parent)
    }

    fn deliver(&mut self, record: MutationRecord) {
        let mut interested = Vec::new();
        for (index, observer) in self.observers.iter().enumerate() {
            let in_scope = observer.target == record.target
                || (observer.options.subtree
                    && self.is_inclusive_ancestor(observer.target, record.target));
            if in_scope && observer.wants(&record) {
                interested.push(index);
            }
        }

        let mut closed = Vec::new();
        for index in interested {
            let observer = &self.observers[index];
            if observer.tx.send(vec![record.clone()]).is_err() {
                closed.push(observer.id);
            }
        }

        // Receiver dropped without a disconnect
        if !closed.is_empty() {
            self.observers.retain(|o| !closed.contains(&o.id));
        }
    }
}

/// In-process document with a single body root
pub struct MemoryDocument {
    inner: Mutex<DocumentInner>,
}

impl MemoryDocument {
    /// Create an empty document containing only `<body>`
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DocumentInner {
                nodes: vec![Element::new("body")],
                body: NodeId(0),
                observers: Vec::new(),
                next_observer: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DocumentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tag name of a node (lowercase)
    pub fn tag_name(&self, node: NodeId) -> Option<String> {
        self.lock().element(node).ok().map(|e| e.tag.clone())
    }

    /// Direct element children of `node`
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.lock()
            .element(node)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    /// Number of connected elements carrying `id`
    pub fn count_elements_with_id(&self, id: &str) -> usize {
        let inner = self.lock();
        (0..inner.nodes.len())
            .map(NodeId)
            .filter(|n| inner.is_inclusive_ancestor(inner.body, *n))
            .filter(|n| inner.nodes[n.0].attributes.get("id").map(String::as_str) == Some(id))
            .count()
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Dom for MemoryDocument {
    fn body(&self) -> NodeId {
        self.lock().body
    }

    fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        let inner = self.lock();
        (0..inner.nodes.len()).map(NodeId).find(|n| {
            inner.nodes[n.0].attributes.get("id").map(String::as_str) == Some(id)
                && inner.is_inclusive_ancestor(inner.body, *n)
        })
    }

    fn element_id(&self, node: NodeId) -> Option<String> {
        self.lock()
            .element(node)
            .ok()
            .and_then(|e| e.attributes.get("id").cloned())
    }

    fn create_element(&self, tag: &str) -> NodeId {
        let mut inner = self.lock();
        inner.nodes.push(Element::new(tag));
        NodeId(inner.nodes.len() - 1)
    }

    fn set_element_id(&self, node: NodeId, id: &str) -> Result<(), DomError> {
        self.set_attribute(node, "id", id)
    }

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let mut inner = self.lock();
        inner.element(parent)?;
        inner.element(child)?;
        if inner.is_inclusive_ancestor(child, parent) {
            return Err(DomError::HierarchyRequest(child));
        }

        if let Some(old_parent) = inner.detach(child) {
            inner.deliver(MutationRecord::child_list(old_parent, Vec::new(), vec![child]));
        }

        inner.element_mut(parent)?.children.push(child);
        inner.element_mut(child)?.parent = Some(parent);
        inner.deliver(MutationRecord::child_list(parent, vec![child], Vec::new()));
        Ok(())
    }

    fn remove(&self, node: NodeId) -> Result<(), DomError> {
        let mut inner = self.lock();
        inner.element(node)?;
        if let Some(parent) = inner.detach(node) {
            inner.deliver(MutationRecord::child_list(parent, Vec::new(), vec![node]));
        }
        Ok(())
    }

    fn is_connected(&self, node: NodeId) -> bool {
        let inner = self.lock();
        inner.element(node).is_ok() && inner.is_inclusive_ancestor(inner.body, node)
    }

    fn style(&self, node: NodeId, property: &str) -> Option<String> {
        let property = property.to_ascii_lowercase();
        self.lock().element(node).ok().and_then(|e| {
            e.style
                .iter()
                .find(|(p, _)| *p == property)
                .map(|(_, v)| v.clone())
        })
    }

    fn set_style(&self, node: NodeId, property: &str, value: &str) -> Result<(), DomError> {
        let mut inner = self.lock();
        inner.element_mut(node)?.put_style(property, value);
        inner.deliver(MutationRecord::attribute(node, "style"));
        Ok(())
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        let inner = self.lock();
        let element = inner.element(node).ok()?;
        if name == "style" {
            return (!element.style.is_empty()).then(|| element.css_text());
        }
        element.attributes.get(name).cloned()
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let name = name.to_ascii_lowercase();
        let mut inner = self.lock();
        let element = inner.element_mut(node)?;
        if name == "style" {
            element.replace_style(value);
        } else {
            element.attributes.insert(name.clone(), value.to_string());
        }
        inner.deliver(MutationRecord::attribute(node, &name));
        Ok(())
    }

    fn inner_html(&self, node: NodeId) -> Option<String> {
        self.lock().element(node).ok().map(|e| e.markup.clone())
    }

    fn set_inner_html(&self, node: NodeId, markup: &str) -> Result<(), DomError> {
        let mut inner = self.lock();
        let children = std::mem::take(&mut inner.element_mut(node)?.children);
        for child in &children {
            if let Ok(c) = inner.element_mut(*child) {
                c.parent = None;
            }
        }
        inner.element_mut(node)?.markup = markup.to_string();
        inner.deliver(MutationRecord::child_list(node, Vec::new(), children));
        Ok(())
    }

    fn observe(
        &self,
        target: NodeId,
        options: ObserveOptions,
    ) -> Result<MutationSubscription, DomError> {
        let mut inner = self.lock();
        inner.element(target)?;

        let id = ObserverId(inner.next_observer);
        inner.next_observer += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.observers.push(Observer {
            id,
            target,
            options,
            tx,
        });

        Ok(MutationSubscription { id, records: rx })
    }

    fn disconnect(&self, observer: ObserverId) {
        self.lock().observers.retain(|o| o.id != observer);
    }
}
