//! In-memory document tree driven by the DOM imports.
//!
//! Nodes live in an arena keyed by [`NodeId`]; handles held by the guest
//! refer to nodes by id, so two handles to the same node observe the same
//! mutations. Markup assigned through `set_inner_html` is parsed into
//! element, text and comment nodes by a small forgiving tokenizer; it does
//! not implement the HTML tree-construction rules (no implied end tags).

use crate::error::{BridgeError, BridgeResult, HostError};
use crate::value::{Arena, ClosureId, NodeId};
use std::fmt::Write as _;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Elements whose text content is neither entity-decoded nor escaped.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element {
        tag: String,
        namespace: Option<String>,
        attributes: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
    Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub event_type: String,
    pub closure: ClosureId,
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    listeners: Vec<Listener>,
}

impl NodeData {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
        }
    }

    fn can_have_children(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Document | NodeKind::Element { .. } | NodeKind::Fragment
        )
    }
}

#[derive(Debug)]
pub struct Document {
    nodes: Arena<NodeId, NodeData>,
    root: NodeId,
    head: NodeId,
    body: NodeId,
    /// Children detached by a bulk replacement, awaiting reclamation.
    orphans: Vec<NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// A document holding `<html><head></head><body></body></html>`.
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let root = nodes.insert(NodeData::new(NodeKind::Document));
        let mut document = Self {
            nodes,
            root,
            head: root,
            body: root,
            orphans: Vec::new(),
        };
        let html = document.element("html", None);
        let head = document.element("head", None);
        let body = document.element("body", None);
        document.attach(root, html, None);
        document.attach(html, head, None);
        document.attach(html, body, None);
        document.head = head;
        document.body = body;
        document
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn node(&self, id: NodeId) -> BridgeResult<&NodeData> {
        self.nodes
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown node {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> BridgeResult<&mut NodeData> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown node {id}")))
    }

    pub fn kind(&self, id: NodeId) -> BridgeResult<&NodeKind> {
        Ok(&self.node(id)?.kind)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// `id` followed by each of its ancestors, ending at the tree's root.
    pub fn ancestors(&self, id: NodeId) -> BridgeResult<Vec<NodeId>> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.node(current)?.parent {
            path.push(parent);
            current = parent;
        }
        Ok(path)
    }

    /// Children detached by `set_text_content` or `set_inner_html` since
    /// the last call.
    pub fn take_orphans(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.orphans)
    }

    /// Free a detached subtree rooted at `id`.
    ///
    /// Descendants for which `keep` holds survive as detached roots of their
    /// own. Attached nodes and the document skeleton are never freed.
    /// Returns the number of nodes removed.
    pub fn reclaim(&mut self, id: NodeId, keep: impl Fn(NodeId) -> bool) -> usize {
        if id == self.root || id == self.head || id == self.body {
            return 0;
        }
        match self.nodes.get(id) {
            Some(data) if data.parent.is_none() => {}
            _ => return 0,
        }
        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(data) = self.nodes.remove(next) else {
                continue;
            };
            removed += 1;
            for child in data.children {
                if keep(child) || child == self.head || child == self.body {
                    if let Some(survivor) = self.nodes.get_mut(child) {
                        survivor.parent = None;
                    }
                } else {
                    stack.push(child);
                }
            }
        }
        tracing::trace!(node = %id, removed, "reclaimed detached subtree");
        removed
    }

    fn element(&mut self, tag: &str, namespace: Option<String>) -> NodeId {
        self.nodes.insert(NodeData::new(NodeKind::Element {
            tag: tag.to_string(),
            namespace,
            attributes: Vec::new(),
        }))
    }

    pub fn create_element(&mut self, tag: &str) -> BridgeResult<NodeId> {
        validate_name(tag)?;
        Ok(self.element(&tag.to_ascii_lowercase(), None))
    }

    pub fn create_element_ns(&mut self, namespace: Option<&str>, qualified: &str) -> BridgeResult<NodeId> {
        validate_name(qualified)?;
        let namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_owned);
        Ok(self.element(qualified, namespace))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.nodes.insert(NodeData::new(NodeKind::Text(text.to_string())))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.nodes.insert(NodeData::new(NodeKind::Comment(text.to_string())))
    }

    pub fn create_fragment(&mut self) -> NodeId {
        self.nodes.insert(NodeData::new(NodeKind::Fragment))
    }

    /// Copy `id` (and its subtree when `deep`). Listeners are not copied.
    pub fn clone_node(&mut self, id: NodeId, deep: bool) -> BridgeResult<NodeId> {
        let source = self.node(id)?;
        if source.kind == NodeKind::Document {
            return Err(HostError::new("NotSupportedError", "documents cannot be cloned").into());
        }
        let kind = source.kind.clone();
        let children = if deep { source.children.clone() } else { Vec::new() };

        let copy = self.nodes.insert(NodeData::new(kind));
        for child in children {
            let child_copy = self.clone_node(child, true)?;
            self.attach(copy, child_copy, None);
        }
        Ok(copy)
    }

    pub fn parent(&self, id: NodeId) -> BridgeResult<Option<NodeId>> {
        Ok(self.node(id)?.parent)
    }

    pub fn children(&self, id: NodeId) -> BridgeResult<&[NodeId]> {
        Ok(&self.node(id)?.children)
    }

    pub fn child_count(&self, id: NodeId) -> BridgeResult<usize> {
        Ok(self.node(id)?.children.len())
    }

    pub fn first_child(&self, id: NodeId) -> BridgeResult<Option<NodeId>> {
        Ok(self.node(id)?.children.first().copied())
    }

    pub fn next_sibling(&self, id: NodeId) -> BridgeResult<Option<NodeId>> {
        self.sibling(id, 1)
    }

    pub fn previous_sibling(&self, id: NodeId) -> BridgeResult<Option<NodeId>> {
        self.sibling(id, -1)
    }

    fn sibling(&self, id: NodeId, step: isize) -> BridgeResult<Option<NodeId>> {
        let Some(parent) = self.node(id)?.parent else {
            return Ok(None);
        };
        let siblings = &self.node(parent)?.children;
        let index = self.index_in(parent, id)?;
        Ok(index
            .checked_add_signed(step)
            .and_then(|i| siblings.get(i))
            .copied())
    }

    fn index_in(&self, parent: NodeId, child: NodeId) -> BridgeResult<usize> {
        self.node(parent)?
            .children
            .iter()
            .position(|c| *c == child)
            .ok_or_else(|| BridgeError::protocol(format!("{child} missing from its parent {parent}")))
    }

    fn is_inclusive_ancestor(&self, ancestor: NodeId, mut node: NodeId) -> BridgeResult<bool> {
        loop {
            if node == ancestor {
                return Ok(true);
            }
            match self.node(node)?.parent {
                Some(parent) => node = parent,
                None => return Ok(false),
            }
        }
    }

    fn detach(&mut self, child: NodeId) -> BridgeResult<()> {
        if let Some(parent) = self.node_mut(child)?.parent.take() {
            self.node_mut(parent)?.children.retain(|c| *c != child);
        }
        Ok(())
    }

    /// Link an already-detached node. Only used on nodes known to exist.
    fn attach(&mut self, parent: NodeId, child: NodeId, index: Option<usize>) {
        if let Some(data) = self.nodes.get_mut(parent) {
            match index {
                Some(i) => data.children.insert(i, child),
                None => data.children.push(child),
            }
        }
        if let Some(data) = self.nodes.get_mut(child) {
            data.parent = Some(parent);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> BridgeResult<()> {
        self.insert_before(parent, child, None)
    }

    /// Insert `child` under `parent` before `reference` (at the end if none).
    ///
    /// Inserting a fragment moves its children instead.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> BridgeResult<()> {
        if !self.node(parent)?.can_have_children() {
            return Err(HostError::hierarchy("parent cannot have children").into());
        }
        match self.node(child)?.kind {
            NodeKind::Document => {
                return Err(HostError::hierarchy("a document cannot be inserted").into())
            }
            NodeKind::Text(_) if parent == self.root => {
                return Err(HostError::hierarchy("text cannot be a document child").into())
            }
            _ => {}
        }
        if self.is_inclusive_ancestor(child, parent)? {
            return Err(HostError::hierarchy("the new child contains the parent").into());
        }
        if let Some(reference) = reference {
            if self.node(reference)?.parent != Some(parent) {
                return Err(HostError::not_found("reference node is not a child of this node").into());
            }
        }

        // A node inserted before itself stays put.
        let reference = match reference {
            Some(r) if r == child => self.next_sibling(child)?,
            other => other,
        };

        let moving = if self.node(child)?.kind == NodeKind::Fragment {
            std::mem::take(&mut self.node_mut(child)?.children)
        } else {
            self.detach(child)?;
            vec![child]
        };

        let mut index = match reference {
            Some(r) => Some(self.index_in(parent, r)?),
            None => None,
        };
        for node in moving {
            if let Some(data) = self.nodes.get_mut(node) {
                data.parent = None;
            }
            self.attach(parent, node, index);
            index = index.map(|i| i + 1);
        }
        Ok(())
    }

    /// Insert `new` immediately before `node`. No-op when `node` is detached.
    pub fn before(&mut self, node: NodeId, new: NodeId) -> BridgeResult<()> {
        if node == new {
            return Ok(());
        }
        match self.node(node)?.parent {
            Some(parent) => self.insert_before(parent, new, Some(node)),
            None => Ok(()),
        }
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> BridgeResult<()> {
        if self.node(child)?.parent != Some(parent) {
            return Err(HostError::not_found("node is not a child of this node").into());
        }
        self.detach(child)
    }

    /// Detach `node` from its parent, if any.
    pub fn remove(&mut self, node: NodeId) -> BridgeResult<()> {
        self.detach(node)
    }

    pub fn get_attribute(&self, id: NodeId, name: &str) -> BridgeResult<Option<String>> {
        let name = self.attribute_key(id, name)?;
        Ok(match &self.node(id)?.kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone()),
            _ => None,
        })
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> BridgeResult<()> {
        validate_name(name)?;
        let name = self.attribute_key(id, name)?;
        match &mut self.node_mut(id)?.kind {
            NodeKind::Element { attributes, .. } => {
                match attributes.iter_mut().find(|(key, _)| *key == name) {
                    Some((_, existing)) => *existing = value.to_string(),
                    None => attributes.push((name, value.to_string())),
                }
                Ok(())
            }
            _ => Err(HostError::type_error("attributes can only be set on elements").into()),
        }
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> BridgeResult<()> {
        let name = self.attribute_key(id, name)?;
        if let NodeKind::Element { attributes, .. } = &mut self.node_mut(id)?.kind {
            attributes.retain(|(key, _)| *key != name);
        }
        Ok(())
    }

    /// HTML elements match attribute names case-insensitively.
    fn attribute_key(&self, id: NodeId, name: &str) -> BridgeResult<String> {
        Ok(match &self.node(id)?.kind {
            NodeKind::Element { namespace: None, .. } => name.to_ascii_lowercase(),
            _ => name.to_string(),
        })
    }

    /// Replace the children (or character data) of `id` with `text`.
    pub fn set_text_content(&mut self, id: NodeId, text: &str) -> BridgeResult<()> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Text(data) | NodeKind::Comment(data) => {
                *data = text.to_string();
                return Ok(());
            }
            NodeKind::Document => return Ok(()),
            NodeKind::Element { .. } | NodeKind::Fragment => {}
        }
        self.clear_children(id)?;
        if !text.is_empty() {
            let node = self.create_text(text);
            self.attach(id, node, None);
        }
        Ok(())
    }

    pub fn set_inner_html(&mut self, id: NodeId, html: &str) -> BridgeResult<()> {
        if !self.node(id)?.can_have_children() || id == self.root {
            return Err(HostError::new("NoModificationAllowedError", "cannot set markup here").into());
        }
        self.clear_children(id)?;
        let mut parser = MarkupParser {
            chars: html.chars().collect(),
            pos: 0,
        };
        parser.parse_into(self, id);
        Ok(())
    }

    /// Serialization of the children of `id`.
    pub fn inner_html(&self, id: NodeId) -> BridgeResult<String> {
        let mut out = String::new();
        for child in &self.node(id)?.children {
            self.serialize(*child, &mut out)?;
        }
        Ok(out)
    }

    fn clear_children(&mut self, id: NodeId) -> BridgeResult<()> {
        let children = std::mem::take(&mut self.node_mut(id)?.children);
        for child in children {
            if let Some(data) = self.nodes.get_mut(child) {
                data.parent = None;
                self.orphans.push(child);
            }
        }
        Ok(())
    }

    /// `None` for the document itself.
    pub fn text_content(&self, id: NodeId) -> BridgeResult<Option<String>> {
        match &self.node(id)?.kind {
            NodeKind::Document => Ok(None),
            NodeKind::Text(data) | NodeKind::Comment(data) => Ok(Some(data.clone())),
            NodeKind::Element { .. } | NodeKind::Fragment => {
                let mut out = String::new();
                self.collect_text(id, &mut out)?;
                Ok(Some(out))
            }
        }
    }

    fn collect_text(&self, id: NodeId, out: &mut String) -> BridgeResult<()> {
        for child in &self.node(id)?.children {
            match &self.node(*child)?.kind {
                NodeKind::Text(data) => out.push_str(data),
                NodeKind::Element { .. } => self.collect_text(*child, out)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn outer_html(&self, id: NodeId) -> BridgeResult<String> {
        let mut out = String::new();
        self.serialize(id, &mut out)?;
        Ok(out)
    }

    fn serialize(&self, id: NodeId, out: &mut String) -> BridgeResult<()> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Text(data) if self.in_raw_text(node) => out.push_str(data),
            NodeKind::Text(data) => out.push_str(&escape(data, false)),
            NodeKind::Comment(data) => {
                let _ = write!(out, "<!--{data}-->");
            }
            NodeKind::Document | NodeKind::Fragment => {
                for child in &node.children {
                    self.serialize(*child, out)?;
                }
            }
            NodeKind::Element { tag, attributes, .. } => {
                out.push('<');
                out.push_str(tag);
                for (key, value) in attributes {
                    let _ = write!(out, " {key}=\"{}\"", escape(value, true));
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) && node.children.is_empty() {
                    return Ok(());
                }
                for child in &node.children {
                    self.serialize(*child, out)?;
                }
                let _ = write!(out, "</{tag}>");
            }
        }
        Ok(())
    }

    fn in_raw_text(&self, node: &NodeData) -> bool {
        let parent = node.parent.and_then(|p| self.nodes.get(p));
        matches!(
            parent.map(|p| &p.kind),
            Some(NodeKind::Element { tag, namespace: None, .. }) if RAW_TEXT_ELEMENTS.contains(&tag.as_str())
        )
    }

    /// Descendants of `scope` in tree order, excluding `scope`.
    fn descendants(&self, scope: NodeId) -> BridgeResult<Vec<NodeId>> {
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = self.node(scope)?.children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.node(id)?.children.iter().rev().copied());
        }
        Ok(order)
    }

    pub fn get_element_by_id(&self, wanted: &str) -> BridgeResult<Option<NodeId>> {
        for id in self.descendants(self.root)? {
            if let NodeKind::Element { attributes, .. } = &self.node(id)?.kind {
                if attributes.iter().any(|(k, v)| k == "id" && v == wanted) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// First descendant of `scope` matching `selector`.
    pub fn query_selector(&self, scope: NodeId, selector: &str) -> BridgeResult<Option<NodeId>> {
        let selector = Selector::parse(selector)?;
        for id in self.descendants(scope)? {
            if selector.matches(self, id)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Register a listener. Registering the same pair twice has no effect.
    pub fn add_listener(&mut self, node: NodeId, event_type: &str, closure: ClosureId) -> BridgeResult<()> {
        let listeners = &mut self.node_mut(node)?.listeners;
        if !listeners
            .iter()
            .any(|l| l.event_type == event_type && l.closure == closure)
        {
            listeners.push(Listener {
                event_type: event_type.to_string(),
                closure,
            });
        }
        Ok(())
    }

    pub fn remove_listener(&mut self, node: NodeId, event_type: &str, closure: ClosureId) -> BridgeResult<()> {
        self.node_mut(node)?
            .listeners
            .retain(|l| !(l.event_type == event_type && l.closure == closure));
        Ok(())
    }

    /// Snapshot of the closures listening for `event_type` on `node`.
    pub fn listeners(&self, node: NodeId, event_type: &str) -> BridgeResult<Vec<ClosureId>> {
        Ok(self
            .node(node)?
            .listeners
            .iter()
            .filter(|l| l.event_type == event_type)
            .map(|l| l.closure)
            .collect())
    }
}

fn validate_name(name: &str) -> BridgeResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == ':' => chars
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(HostError::invalid_character(format!("{name:?} is not a valid name")).into())
    }
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
    out
}

/// Tokenizes markup straight into the tree below a context node.
///
/// Unclosed elements are closed at end of input, stray end tags are
/// ignored and an end tag closes every element opened after its match.
struct MarkupParser {
    chars: Vec<char>,
    pos: usize,
}

impl MarkupParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn starts_with_ignore_case(&self, prefix: &str) -> bool {
        prefix
            .chars()
            .enumerate()
            .all(|(i, p)| self.peek_at(i).is_some_and(|c| c.eq_ignore_ascii_case(&p)))
    }

    /// Consume input up to and including `end`, returning what came before.
    fn until(&mut self, end: &str) -> String {
        let start = self.pos;
        while self.pos < self.chars.len() {
            if self.starts_with_ignore_case(end) {
                let text = self.chars[start..self.pos].iter().collect();
                self.pos += end.chars().count();
                return text;
            }
            self.pos += 1;
        }
        self.chars[start..].iter().collect()
    }

    fn parse_into(&mut self, document: &mut Document, context: NodeId) {
        let mut open = vec![(context, String::new())];
        let mut text = String::new();
        while let Some(c) = self.peek() {
            let parent = open.last().map_or(context, |(id, _)| *id);
            match (c, self.peek_at(1)) {
                ('<', Some('!')) => {
                    flush_text(document, parent, &mut text);
                    self.declaration(document, parent);
                }
                ('<', Some('/')) => {
                    flush_text(document, parent, &mut text);
                    self.pos += 2;
                    let name = self.name();
                    self.until(">");
                    // The context entry has no tag, so it is never closed.
                    if let Some(index) = open.iter().rposition(|(_, tag)| !tag.is_empty() && *tag == name) {
                        open.truncate(index);
                    }
                }
                ('<', Some(next)) if next.is_ascii_alphabetic() => {
                    flush_text(document, parent, &mut text);
                    self.pos += 1;
                    let (tag, attributes, self_closing) = self.start_tag();
                    let element = document.nodes.insert(NodeData::new(NodeKind::Element {
                        tag: tag.clone(),
                        namespace: None,
                        attributes,
                    }));
                    document.attach(parent, element, None);
                    if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
                        let mut raw = self.until(&format!("</{tag}"));
                        self.until(">");
                        flush_text(document, element, &mut raw);
                    } else if !self_closing && !VOID_ELEMENTS.contains(&tag.as_str()) {
                        open.push((element, tag));
                    }
                }
                ('&', _) => text.push_str(&self.entity()),
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
        let parent = open.last().map_or(context, |(id, _)| *id);
        flush_text(document, parent, &mut text);
    }

    /// Comments, doctypes and other `<!` constructs.
    fn declaration(&mut self, document: &mut Document, parent: NodeId) {
        self.pos += 2;
        let data = if self.starts_with_ignore_case("--") {
            self.pos += 2;
            if self.peek() == Some('>') {
                self.pos += 1;
                String::new()
            } else {
                self.until("-->")
            }
        } else if self.starts_with_ignore_case("doctype") {
            self.until(">");
            return;
        } else {
            self.until(">")
        };
        let comment = document.create_comment(&data);
        document.attach(parent, comment, None);
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && c != '/' && c != '>')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .to_ascii_lowercase()
    }

    fn start_tag(&mut self) -> (String, Vec<(String, String)>, bool) {
        let tag = self.name();
        let mut attributes: Vec<(String, String)> = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return (tag, attributes, false),
                Some('>') => {
                    self.pos += 1;
                    return (tag, attributes, false);
                }
                Some('/') if self.peek_at(1) == Some('>') => {
                    self.pos += 2;
                    return (tag, attributes, true);
                }
                Some('/') => self.pos += 1,
                Some(_) => {
                    let start = self.pos;
                    while self
                        .peek()
                        .is_some_and(|c| !c.is_whitespace() && !matches!(c, '=' | '>' | '/'))
                    {
                        self.pos += 1;
                    }
                    if start == self.pos {
                        // A lone `=` with no name.
                        self.pos += 1;
                        continue;
                    }
                    let name = self.chars[start..self.pos]
                        .iter()
                        .collect::<String>()
                        .to_ascii_lowercase();
                    self.skip_ws();
                    let value = if self.peek() == Some('=') {
                        self.pos += 1;
                        self.skip_ws();
                        self.attribute_value()
                    } else {
                        String::new()
                    };
                    // The first occurrence of a duplicated attribute wins.
                    if !attributes.iter().any(|(key, _)| *key == name) {
                        attributes.push((name, value));
                    }
                }
            }
        }
    }

    fn attribute_value(&mut self) -> String {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                Some(q)
            }
            _ => None,
        };
        let mut value = String::new();
        while let Some(c) = self.peek() {
            match quote {
                Some(q) if c == q => {
                    self.pos += 1;
                    break;
                }
                None if c.is_whitespace() || c == '>' => break,
                _ if c == '&' => value.push_str(&self.entity()),
                _ => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
        value
    }

    /// Decode the character reference at `&`, or take the `&` literally.
    fn entity(&mut self) -> String {
        let start = self.pos;
        self.pos += 1;
        let mut body = String::new();
        while let Some(c) = self.peek() {
            if c == ';' || body.len() > 10 || !(c.is_ascii_alphanumeric() || c == '#') {
                break;
            }
            body.push(c);
            self.pos += 1;
        }
        let decoded = if self.peek() == Some(';') {
            decode_entity(&body)
        } else {
            None
        };
        match decoded {
            Some(c) => {
                self.pos += 1;
                c.to_string()
            }
            None => {
                self.pos = start + 1;
                "&".to_string()
            }
        }
    }
}

fn decode_entity(body: &str) -> Option<char> {
    let numeric = |digits: &str, radix| u32::from_str_radix(digits, radix).ok().and_then(char::from_u32);
    match body {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => match body.strip_prefix('#') {
            Some(hex) if hex.starts_with(['x', 'X']) => numeric(&hex[1..], 16),
            Some(decimal) => numeric(decimal, 10),
            None => None,
        },
    }
}

fn flush_text(document: &mut Document, parent: NodeId, text: &mut String) {
    if text.is_empty() {
        return;
    }
    let node = document.create_text(text);
    document.attach(parent, node, None);
    text.clear();
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttributeMatch {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeMatch>,
}

impl Compound {
    fn matches(&self, kind: &NodeKind) -> bool {
        let NodeKind::Element { tag, attributes, .. } = kind else {
            return false;
        };
        let attr = |name: &str| {
            attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        if let Some(wanted) = &self.tag {
            if !tag.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }
        if let Some(wanted) = &self.id {
            if attr("id") != Some(wanted.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let classes: Vec<&str> = attr("class").unwrap_or("").split_whitespace().collect();
            if !self.classes.iter().all(|c| classes.contains(&c.as_str())) {
                return false;
            }
        }
        self.attributes.iter().all(|m| match (attr(&m.name), &m.value) {
            (Some(_), None) => true,
            (Some(actual), Some(wanted)) => actual == wanted,
            (None, _) => false,
        })
    }
}

/// A comma-separated list of descendant-combinator chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Vec<Compound>>,
}

impl Selector {
    pub fn parse(source: &str) -> BridgeResult<Self> {
        let mut parser = SelectorParser {
            chars: source.chars().collect(),
            pos: 0,
            source,
        };
        let mut alternatives = Vec::new();
        loop {
            alternatives.push(parser.chain()?);
            parser.skip_ws();
            match parser.bump() {
                None => break,
                Some(',') => continue,
                Some(c) => return Err(parser.error(&format!("unexpected {c:?}"))),
            }
        }
        Ok(Self { alternatives })
    }

    fn matches(&self, document: &Document, id: NodeId) -> BridgeResult<bool> {
        for chain in &self.alternatives {
            if chain_matches(document, chain, id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn chain_matches(document: &Document, chain: &[Compound], id: NodeId) -> BridgeResult<bool> {
    let Some((subject, ancestors)) = chain.split_last() else {
        return Ok(false);
    };
    if !subject.matches(document.kind(id)?) {
        return Ok(false);
    }
    let mut current = id;
    for compound in ancestors.iter().rev() {
        loop {
            match document.parent(current)? {
                Some(parent) => {
                    current = parent;
                    if compound.matches(document.kind(parent)?) {
                        break;
                    }
                }
                None => return Ok(false),
            }
        }
    }
    Ok(true)
}

struct SelectorParser<'s> {
    chars: Vec<char>,
    pos: usize,
    source: &'s str,
}

impl SelectorParser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn error(&self, detail: &str) -> BridgeError {
        HostError::syntax_error(format!("'{}' is not a valid selector: {detail}", self.source)).into()
    }

    fn chain(&mut self) -> BridgeResult<Vec<Compound>> {
        let mut chain = Vec::new();
        self.skip_ws();
        loop {
            chain.push(self.compound()?);
            self.skip_ws();
            match self.peek() {
                None | Some(',') => return Ok(chain),
                _ => {}
            }
        }
    }

    fn ident(&mut self) -> BridgeResult<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn compound(&mut self) -> BridgeResult<Compound> {
        let mut compound = Compound::default();
        let mut consumed = false;

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                consumed = true;
            }
            Some(c) if c.is_alphabetic() => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
                consumed = true;
            }
            _ => {}
        }

        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.attribute()?);
                }
                None | Some(',') => break,
                Some(c) if c.is_whitespace() => break,
                Some(c) => return Err(self.error(&format!("unsupported {c:?}"))),
            }
            consumed = true;
        }

        if consumed {
            Ok(compound)
        } else {
            Err(self.error("empty compound selector"))
        }
    }

    fn attribute(&mut self) -> BridgeResult<AttributeMatch> {
        self.skip_ws();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_ws();
        let value = match self.bump() {
            Some(']') => return Ok(AttributeMatch { name, value: None }),
            Some('=') => {
                self.skip_ws();
                self.attribute_value()?
            }
            _ => return Err(self.error("malformed attribute selector")),
        };
        self.skip_ws();
        match self.bump() {
            Some(']') => Ok(AttributeMatch {
                name,
                value: Some(value),
            }),
            _ => Err(self.error("unterminated attribute selector")),
        }
    }

    fn attribute_value(&mut self) -> BridgeResult<String> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != quote) {
                    self.pos += 1;
                }
                if self.bump() != Some(quote) {
                    return Err(self.error("unterminated string"));
                }
                Ok(self.chars[start..self.pos - 1].iter().collect())
            }
            _ => self.ident(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_syntax_error(err: BridgeError) -> bool {
        matches!(err, BridgeError::HostOperation(e) if e.name == "SyntaxError")
    }

    fn sample() -> (Document, NodeId, NodeId, NodeId) {
        let mut doc = Document::new();
        let list = doc.create_element("ul").expect("ul");
        doc.set_attribute(list, "id", "menu").expect("id");
        doc.set_attribute(list, "class", "nav main").expect("class");
        let first = doc.create_element("li").expect("li");
        doc.set_attribute(first, "data-kind", "a").expect("attr");
        let second = doc.create_element("LI").expect("li");
        doc.set_attribute(second, "class", "active").expect("class");
        doc.append_child(list, first).expect("append");
        doc.append_child(list, second).expect("append");
        doc.append_child(doc.body(), list).expect("append");
        (doc, list, first, second)
    }

    #[test]
    fn new_document_has_head_and_body() {
        let doc = Document::new();
        assert_eq!(
            doc.outer_html(doc.root()).expect("html"),
            "<html><head></head><body></body></html>"
        );
    }

    #[test]
    fn selectors_find_first_match_in_tree_order() {
        let (doc, list, first, second) = sample();
        let body = doc.body();
        assert_eq!(doc.query_selector(doc.root(), "li").expect("q"), Some(first));
        assert_eq!(doc.query_selector(doc.root(), "#menu").expect("q"), Some(list));
        assert_eq!(doc.query_selector(doc.root(), "ul.nav.main").expect("q"), Some(list));
        assert_eq!(doc.query_selector(doc.root(), "li.active").expect("q"), Some(second));
        assert_eq!(doc.query_selector(doc.root(), "[data-kind=a]").expect("q"), Some(first));
        assert_eq!(doc.query_selector(doc.root(), "[data-kind='b']").expect("q"), None);
        assert_eq!(doc.query_selector(doc.root(), "body  li[data-kind]").expect("q"), Some(first));
        assert_eq!(doc.query_selector(doc.root(), "head li, .active").expect("q"), Some(second));
        assert_eq!(doc.query_selector(list, "*").expect("q"), Some(first));
        assert_eq!(doc.query_selector(body, "body").expect("q"), None);
    }

    #[test]
    fn malformed_selectors_are_syntax_errors() {
        let (doc, ..) = sample();
        for bad in ["", "li >", "a > b", "div,", "[x", "#", "p:hover", "[a=\"b]"] {
            let err = doc.query_selector(doc.root(), bad).expect_err(bad);
            assert!(is_syntax_error(err), "{bad}");
        }
    }

    #[test]
    fn insertion_moves_nodes_and_checks_hierarchy() {
        let (mut doc, list, first, second) = sample();
        doc.insert_before(list, second, Some(first)).expect("reorder");
        assert_eq!(doc.children(list).expect("children"), &[second, first]);

        let err = doc.append_child(first, list).expect_err("cycle");
        assert!(matches!(err, BridgeError::HostOperation(e) if e.name == "HierarchyRequestError"));

        let stray = doc.create_element("p").expect("p");
        let err = doc.remove_child(list, stray).expect_err("not a child");
        assert!(matches!(err, BridgeError::HostOperation(e) if e.name == "NotFoundError"));

        doc.before(first, stray).expect("before");
        assert_eq!(doc.previous_sibling(first).expect("sibling"), Some(stray));
        doc.remove(stray).expect("remove");
        assert_eq!(doc.parent(stray).expect("parent"), None);
    }

    #[test]
    fn fragments_move_their_children() {
        let mut doc = Document::new();
        let fragment = doc.create_fragment();
        let a = doc.create_text("a");
        let b = doc.create_comment("b");
        doc.append_child(fragment, a).expect("a");
        doc.append_child(fragment, b).expect("b");
        doc.append_child(doc.body(), fragment).expect("fragment");

        assert!(doc.children(fragment).expect("empty").is_empty());
        assert_eq!(doc.children(doc.body()).expect("body"), &[a, b]);
        assert_eq!(
            doc.outer_html(doc.body()).expect("html"),
            "<body>a<!--b--></body>"
        );
    }

    #[test]
    fn text_content_replaces_children_and_escapes() {
        let (mut doc, list, ..) = sample();
        doc.set_text_content(list, "1 < 2 & 3").expect("text");
        assert_eq!(doc.child_count(list).expect("count"), 1);
        assert_eq!(
            doc.outer_html(list).expect("html"),
            "<ul id=\"menu\" class=\"nav main\">1 &lt; 2 &amp; 3</ul>"
        );
        assert_eq!(doc.text_content(doc.body()).expect("text").as_deref(), Some("1 < 2 & 3"));
        assert_eq!(doc.text_content(doc.root()).expect("text"), None);
    }

    #[test]
    fn inner_html_builds_queryable_nodes() {
        let (mut doc, list, first, _) = sample();
        doc.set_inner_html(list, "<li>x</li>").expect("markup");
        assert_eq!(
            doc.outer_html(list).expect("html"),
            "<ul id=\"menu\" class=\"nav main\"><li>x</li></ul>"
        );
        assert_eq!(doc.text_content(list).expect("text").as_deref(), Some("x"));
        assert_eq!(doc.parent(first).expect("parent"), None);
        assert_eq!(doc.take_orphans().len(), 2);

        let body = doc.body();
        doc.set_inner_html(body, "<span id=\"x\">hi</span>").expect("markup");
        let span = doc.get_element_by_id("x").expect("lookup").expect("span");
        assert_eq!(doc.query_selector(doc.root(), "span").expect("q"), Some(span));
        assert_eq!(doc.parent(span).expect("parent"), Some(body));
        assert_eq!(doc.text_content(span).expect("text").as_deref(), Some("hi"));
    }

    #[test]
    fn markup_parser_handles_comments_entities_and_stray_tags() {
        let mut doc = Document::new();
        let div = doc.create_element("div").expect("div");
        doc.set_inner_html(
            div,
            "<!doctype html><!-- note --><P Class=a title='x &amp; y' hidden>1 &lt; 2&#33; &bogus</p>\
             <br><img src=a.png/></b><ul><li>a<li>b</ul><script>if (a < b) {}</script>tail",
        )
        .expect("markup");

        let children = doc.children(div).expect("children").to_vec();
        assert!(matches!(doc.kind(children[0]).expect("kind"), NodeKind::Comment(c) if c == " note "));
        let p = doc.query_selector(div, "p.a[hidden]").expect("q").expect("p");
        assert_eq!(doc.get_attribute(p, "title").expect("attr").as_deref(), Some("x & y"));
        assert_eq!(doc.text_content(p).expect("text").as_deref(), Some("1 < 2! &bogus"));
        assert!(doc.query_selector(div, "br").expect("q").is_some());
        let img = doc.query_selector(div, "img").expect("q").expect("img");
        assert!(doc.children(img).expect("void").is_empty());

        // Without implied end tags the second item nests inside the first.
        let items = doc.query_selector(div, "ul li li").expect("q");
        assert!(items.is_some());

        let script = doc.query_selector(div, "script").expect("q").expect("script");
        assert_eq!(doc.text_content(script).expect("text").as_deref(), Some("if (a < b) {}"));
        assert_eq!(
            doc.inner_html(script).expect("html"),
            "if (a < b) {}"
        );
        let last = *children.last().expect("tail");
        assert!(matches!(doc.kind(last).expect("kind"), NodeKind::Text(t) if t == "tail"));
    }

    #[test]
    fn unclosed_markup_closes_at_end_of_input() {
        let mut doc = Document::new();
        let body = doc.body();
        doc.set_inner_html(body, "<div><em>deep").expect("markup");
        assert_eq!(
            doc.inner_html(body).expect("html"),
            "<div><em>deep</em></div>"
        );
        doc.set_inner_html(body, "</body>still here").expect("markup");
        assert_eq!(doc.inner_html(body).expect("html"), "still here");
    }

    #[test]
    fn reclaim_frees_detached_subtrees_but_keeps_referenced_nodes() {
        let (mut doc, list, first, second) = sample();
        let before = doc.node_count();
        assert_eq!(doc.reclaim(list, |_| false), 0, "attached nodes stay");

        doc.remove(list).expect("remove");
        assert_eq!(doc.reclaim(list, |id| id == second), 2);
        assert_eq!(doc.node_count(), before - 2);
        assert!(!doc.contains(first));
        assert_eq!(doc.parent(second).expect("survivor"), None);
        assert_eq!(doc.ancestors(second).expect("path"), vec![second]);

        let body = doc.body();
        assert_eq!(
            doc.ancestors(body).expect("path"),
            vec![body, doc.parent(body).expect("html").expect("html"), doc.root()]
        );
        assert_eq!(doc.reclaim(body, |_| false), 0);
    }

    #[test]
    fn deep_clone_copies_subtree_without_parent() {
        let (mut doc, list, ..) = sample();
        let copy = doc.clone_node(list, true).expect("clone");
        assert_eq!(doc.parent(copy).expect("parent"), None);
        assert_eq!(doc.outer_html(copy).expect("copy"), doc.outer_html(list).expect("list"));
        let shallow = doc.clone_node(list, false).expect("clone");
        assert!(doc.children(shallow).expect("children").is_empty());
    }

    #[test]
    fn attribute_names_are_validated_and_case_folded() {
        let mut doc = Document::new();
        let div = doc.create_element("div").expect("div");
        doc.set_attribute(div, "Title", "x").expect("set");
        assert_eq!(doc.get_attribute(div, "title").expect("get").as_deref(), Some("x"));
        doc.remove_attribute(div, "TITLE").expect("remove");
        assert_eq!(doc.get_attribute(div, "title").expect("get"), None);

        let err = doc.set_attribute(div, "1bad", "x").expect_err("invalid");
        assert!(matches!(err, BridgeError::HostOperation(e) if e.name == "InvalidCharacterError"));
        assert!(doc.create_element("").is_err());
    }
}
