//! Page document model: an element arena with inline styles.
//!
//! Tree mutations (`append_child`, `set_attribute`) bump the document
//! revision so observers can tell the tree changed. Inline style writes do
//! not, so styling links never re-triggers the pass that styled them.

use rv_core::RevisitError;
use rv_core::RevisitResult;
use std::collections::BTreeMap;

/// ID used to address elements in the document arena.
pub type NodeId = usize;

const ROOT: NodeId = 0;

/// CSS declaration priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StylePriority {
    Normal,
    Important,
}

impl StylePriority {
    pub fn from_important(important: bool) -> Self {
        if important {
            Self::Important
        } else {
            Self::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleValue {
    pub value: String,
    pub priority: StylePriority,
}

/// An element's `style` attribute, as a property map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineStyle {
    properties: BTreeMap<String, StyleValue>,
}

impl InlineStyle {
    /// Sets `name`. Returns false when value and priority were already set.
    pub fn set_property(&mut self, name: &str, value: &str, priority: StylePriority) -> bool {
        if let Some(current) = self.properties.get(name) {
            if current.value == value && current.priority == priority {
                return false;
            }
        }

        self.properties.insert(
            name.to_owned(),
            StyleValue {
                value: value.to_owned(),
                priority,
            },
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<&StyleValue> {
        self.properties.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(|style| style.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    style: InlineStyle,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    visited: bool,
}

impl Element {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
            style: InlineStyle::default(),
            parent: None,
            children: Vec::new(),
            visited: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn style(&self) -> &InlineStyle {
        &self.style
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Whether the rendering environment itself reports the link as visited.
    pub fn is_visited(&self) -> bool {
        self.visited
    }
}

/// Element tree of one loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    url: String,
    nodes: Vec<Element>,
    revision: u64,
}

impl Document {
    /// Empty document whose root is an `<html>` element.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            nodes: vec![Element::new("html")],
            revision: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Same-document navigation (history state change).
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        self.nodes.get(id)
    }

    /// Creates a detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Element::new(tag));
        self.nodes.len() - 1
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> RevisitResult<()> {
        self.require(parent)?;
        let attached = self.require(child)?.parent.is_some();
        if attached || child == ROOT {
            return Err(RevisitError::new(
                "dom.already_attached",
                format!("node {child} already has a parent"),
            ));
        }

        if self.ancestors_and_self(parent).any(|ancestor| ancestor == child) {
            return Err(RevisitError::new(
                "dom.cycle",
                format!("appending node {child} under {parent} would create a cycle"),
            ));
        }

        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
        self.revision += 1;
        Ok(())
    }

    /// Creates an element and appends it in one step.
    pub fn append_element(&mut self, parent: NodeId, tag: &str) -> RevisitResult<NodeId> {
        self.require(parent)?;
        let child = self.create_element(tag);
        self.append_child(parent, child)?;
        Ok(child)
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> RevisitResult<()> {
        let element = self.require_mut(id)?;
        let name = name.to_ascii_lowercase();
        match element.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some((_, current)) => *current = value.to_owned(),
            None => element.attributes.push((name, value.to_owned())),
        }
        self.revision += 1;
        Ok(())
    }

    /// Returns whether the declaration changed.
    pub fn set_style_property(
        &mut self,
        id: NodeId,
        name: &str,
        value: &str,
        priority: StylePriority,
    ) -> RevisitResult<bool> {
        Ok(self.require_mut(id)?.style.set_property(name, value, priority))
    }

    pub fn set_visited(&mut self, id: NodeId, visited: bool) -> RevisitResult<()> {
        self.require_mut(id)?.visited = visited;
        Ok(())
    }

    /// Descendants of `id` in tree order, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(element) = self.nodes.get(id) else {
            return out;
        };

        let mut stack: Vec<NodeId> = element.children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.nodes.get(next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Attached elements with tag `tag`, in tree order.
    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeId> {
        std::iter::once(ROOT)
            .chain(self.descendants(ROOT))
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .is_some_and(|element| element.tag.eq_ignore_ascii_case(tag))
            })
            .collect()
    }

    /// Every attached `<a>` element.
    pub fn links(&self) -> Vec<NodeId> {
        self.elements_by_tag("a")
    }

    fn ancestors_and_self(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(id), |current| {
            self.nodes.get(*current).and_then(|element| element.parent)
        })
    }

    fn require(&self, id: NodeId) -> RevisitResult<&Element> {
        self.nodes.get(id).ok_or_else(|| missing_node(id))
    }

    fn require_mut(&mut self, id: NodeId) -> RevisitResult<&mut Element> {
        self.nodes.get_mut(id).ok_or_else(|| missing_node(id))
    }
}

fn missing_node(id: NodeId) -> RevisitError {
    RevisitError::new("dom.node_missing", format!("no node with id {id}"))
}

#[cfg(test)]
mod tests {
    use super::Document;
    use super::StylePriority;

    fn sample() -> (Document, usize, usize, usize) {
        let mut doc = Document::new("https://example.com/");
        let root = doc.root();
        let body = doc.append_element(root, "body").unwrap_or_else(|_| unreachable!());
        let link = doc.append_element(body, "A").unwrap_or_else(|_| unreachable!());
        let span = doc.append_element(link, "span").unwrap_or_else(|_| unreachable!());
        (doc, body, link, span)
    }

    #[test]
    fn new_document_has_only_a_root() {
        let doc = Document::new("https://example.com/");
        assert!(doc.is_empty());
        assert_eq!(doc.element(doc.root()).map(|root| root.tag()), Some("html"));
        assert_eq!(doc.revision(), 0);
    }

    #[test]
    fn tree_mutations_bump_revision_but_styles_do_not() {
        let (mut doc, _, link, _) = sample();
        assert_eq!(doc.revision(), 3);

        assert!(doc.set_attribute(link, "HREF", "/a").is_ok());
        assert_eq!(doc.revision(), 4);
        assert_eq!(doc.element(link).and_then(|el| el.attribute("href")), Some("/a"));

        let changed = doc.set_style_property(link, "color", "red", StylePriority::Normal);
        assert_eq!(changed, Ok(true));
        assert_eq!(doc.revision(), 4);
    }

    #[test]
    fn style_writes_report_changes() {
        let (mut doc, _, link, _) = sample();
        let set = |doc: &mut Document, priority| {
            doc.set_style_property(link, "font-weight", "bold", priority)
        };
        assert_eq!(set(&mut doc, StylePriority::Normal), Ok(true));
        assert_eq!(set(&mut doc, StylePriority::Normal), Ok(false));
        assert_eq!(set(&mut doc, StylePriority::Important), Ok(true));

        let style = doc.element(link).map(|el| el.style().clone()).unwrap_or_default();
        assert_eq!(style.len(), 1);
        assert_eq!(
            style.get("font-weight").map(|value| value.priority),
            Some(StylePriority::Important)
        );
    }

    #[test]
    fn links_and_descendants_follow_tree_order() {
        let (mut doc, body, link, span) = sample();
        let second = doc.append_element(body, "a").unwrap_or_else(|_| unreachable!());
        let detached = doc.create_element("a");

        assert_eq!(doc.links(), vec![link, second]);
        assert_eq!(doc.descendants(body), vec![link, span, second]);
        assert!(!doc.links().contains(&detached));
    }

    #[test]
    fn rejects_invalid_tree_edits() {
        let (mut doc, body, link, _) = sample();

        let reparent = doc.append_child(link, body);
        assert!(reparent.is_err());
        if let Err(error) = reparent {
            assert_eq!(error.code, "dom.already_attached");
        }

        let orphan = doc.create_element("div");
        let inner = doc.append_element(orphan, "p").unwrap_or_else(|_| unreachable!());
        let cycle = doc.append_child(inner, orphan);
        assert!(cycle.is_err());
        if let Err(error) = cycle {
            assert_eq!(error.code, "dom.cycle");
        }

        assert!(doc.set_visited(999, true).is_err());
    }
}
