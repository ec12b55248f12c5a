//! Parsed, immutable view of one window hierarchy dump.
//!
//! The agent reports the on-screen view tree as XML where every view is a
//! `<node>` element carrying a `class` attribute. [`HierarchySnapshot::parse`]
//! stores the tree in an arena and rewrites each `node` tag to its class name
//! (with `$` replaced by `-`) so XPath steps can match on the widget class,
//! e.g. `//android.widget.Button`.
//!
//! Index 0 of the arena is a virtual document node (XPath's `/`); the dump's
//! root element is its only child.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{json, Map, Value};

use crate::device::Device;
use crate::error::DeviceError;
use crate::geometry::{Bounds, Point};
use crate::xpath::{HierarchySource, XPathSelector};

/// Index of a node inside a [`HierarchySnapshot`].
pub type NodeId = usize;

/// Attributes that take part in a node's content identity.
const IDENTITY_ATTRS: [&str; 4] = ["text", "resource-id", "package", "content-desc"];

/// One element of the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub tag: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Identity of a node by content rather than by position in memory: the
/// identity attributes plus the index-free tag path from the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub attrs: [Option<String>; 4],
    pub path: String,
}

/// Immutable arena of hierarchy nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchySnapshot {
    nodes: Vec<Node>,
}

fn safe_tag(class: &str) -> String {
    class.replace('$', "-")
}

fn read_element(start: &BytesStart<'_>) -> Result<Node, DeviceError> {
    let mut tag = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| DeviceError::Hierarchy(format!("invalid element name: {e}")))?
        .to_string();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DeviceError::Hierarchy(format!("attribute error: {e}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| DeviceError::Hierarchy(format!("attribute key error: {e}")))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| DeviceError::Hierarchy(format!("attribute value error: {e}")))?
            .to_string();
        attributes.push((key, value));
    }

    if tag == "node" {
        if let Some(pos) = attributes.iter().position(|(k, _)| k == "class") {
            let (_, class) = attributes.remove(pos);
            if !class.is_empty() {
                tag = safe_tag(&class);
            }
        }
    }

    Ok(Node {
        tag,
        attributes,
        parent: None,
        children: Vec::new(),
    })
}

impl HierarchySnapshot {
    /// Parses a hierarchy dump.
    pub fn parse(xml: &str) -> Result<Self, DeviceError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut nodes = vec![Node {
            tag: String::new(),
            attributes: Vec::new(),
            parent: None,
            children: Vec::new(),
        }];
        let mut stack: Vec<NodeId> = vec![0];

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let id = Self::push(&mut nodes, &stack, read_element(e)?)?;
                    stack.push(id);
                }
                Ok(Event::Empty(ref e)) => {
                    Self::push(&mut nodes, &stack, read_element(e)?)?;
                }
                Ok(Event::End(_)) => {
                    if stack.len() <= 1 {
                        return Err(DeviceError::Hierarchy("unexpected closing tag".into()));
                    }
                    stack.pop();
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(DeviceError::Hierarchy(format!(
                        "at byte {}: {e}",
                        reader.buffer_position()
                    )))
                }
            }
        }

        if stack.len() != 1 {
            return Err(DeviceError::Hierarchy("unclosed element at end of input".into()));
        }
        if nodes[0].children.is_empty() {
            return Err(DeviceError::Hierarchy("no root element".into()));
        }
        Ok(Self { nodes })
    }

    fn push(nodes: &mut Vec<Node>, stack: &[NodeId], mut node: Node) -> Result<NodeId, DeviceError> {
        let parent = *stack.last().unwrap_or(&0);
        if parent == 0 && !nodes[0].children.is_empty() {
            return Err(DeviceError::Hierarchy("multiple root elements".into()));
        }
        let id = nodes.len();
        node.parent = Some(parent);
        nodes.push(node);
        nodes[parent].children.push(id);
        Ok(id)
    }

    /// The virtual document node.
    pub fn document(&self) -> NodeId {
        0
    }

    /// The dump's root element.
    pub fn root(&self) -> NodeId {
        self.nodes[0].children[0]
    }

    /// Number of element nodes (the virtual document node excluded).
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id].attr(name)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// All descendants of `id` in document order, excluding `id` itself.
    ///
    /// Arena ids are assigned in document order, so a node's subtree is the
    /// contiguous id range that follows it.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let end = self.subtree_end(id);
        ((id + 1)..end).collect()
    }

    /// One past the last id inside the subtree rooted at `id`.
    fn subtree_end(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(&last) = self.nodes[cur].children.last() {
            cur = last;
        }
        cur + 1
    }

    pub fn bounds(&self, id: NodeId) -> Option<Bounds> {
        self.attr(id, "bounds").and_then(Bounds::parse)
    }

    /// Tag path from the root element, e.g.
    /// `/hierarchy/android.widget.FrameLayout/android.widget.TextView`.
    pub fn path(&self, id: NodeId) -> String {
        let mut tags = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if n == 0 {
                break;
            }
            tags.push(self.nodes[n].tag.as_str());
            cur = self.nodes[n].parent;
        }
        tags.reverse();
        format!("/{}", tags.join("/"))
    }

    pub fn content_key(&self, id: NodeId) -> ContentKey {
        let node = &self.nodes[id];
        ContentKey {
            attrs: IDENTITY_ATTRS.map(|name| node.attr(name).map(str::to_string)),
            path: self.path(id),
        }
    }
}

// ---------------------------------------------------------------------------
// XmlElement
// ---------------------------------------------------------------------------

/// Long-press duration used by [`XmlElement::long_click`].
const LONG_CLICK: Duration = Duration::from_millis(500);

/// A node of a parsed hierarchy, as returned by XPath queries.
///
/// The element shares its snapshot and owns no node data of its own.
/// Equality and hashing use the node's [`ContentKey`], so the same on-screen
/// view found in two separate dumps compares equal.
#[derive(Clone)]
pub struct XmlElement {
    snapshot: Arc<HierarchySnapshot>,
    id: NodeId,
    device: Device,
}

impl XmlElement {
    pub fn new(snapshot: Arc<HierarchySnapshot>, id: NodeId, device: Device) -> Self {
        Self {
            snapshot,
            id,
            device,
        }
    }

    pub fn snapshot(&self) -> &Arc<HierarchySnapshot> {
        &self.snapshot
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Tag name: the widget class for views, e.g. `android.widget.Button`.
    pub fn tag(&self) -> &str {
        &self.snapshot.node(self.id).tag
    }

    pub fn attrib(&self) -> &[(String, String)] {
        &self.snapshot.node(self.id).attributes
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.snapshot.attr(self.id, name)
    }

    pub fn text(&self) -> Option<&str> {
        self.attr("text")
    }

    /// Edges from the `bounds` attribute. Nodes without one report an empty
    /// rectangle at the origin.
    pub fn bounds(&self) -> Bounds {
        self.snapshot.bounds(self.id).unwrap_or_default()
    }

    /// `(x, y, width, height)` of the element.
    pub fn rect(&self) -> (i32, i32, i32, i32) {
        let b = self.bounds();
        (b.left, b.top, b.width(), b.height())
    }

    /// Point at a fractional offset from the top-left corner.
    pub fn offset(&self, px: f64, py: f64) -> Point {
        self.bounds().offset(px, py)
    }

    pub fn center(&self) -> Point {
        self.bounds().center()
    }

    /// Edges as fractions of a `(width, height)` screen.
    pub fn percent_bounds(&self, window: (u32, u32)) -> (f64, f64, f64, f64) {
        self.bounds().percent(window.0, window.1)
    }

    pub fn content_key(&self) -> ContentKey {
        self.snapshot.content_key(self.id)
    }

    /// Element description in the shape of the agent's `objInfo` result.
    pub fn info(&self) -> Value {
        let mut info = Map::new();
        for key in [
            "text",
            "focusable",
            "enabled",
            "focused",
            "scrollable",
            "selected",
            "clickable",
        ] {
            info.insert(key.to_string(), json!(self.attr(key)));
        }
        let b = self.bounds();
        info.insert("className".into(), json!(self.tag()));
        info.insert(
            "bounds".into(),
            json!({"left": b.left, "top": b.top, "right": b.right, "bottom": b.bottom}),
        );
        info.insert("contentDescription".into(), json!(self.attr("content-desc")));
        info.insert("longClickable".into(), json!(self.attr("long-clickable")));
        info.insert("packageName".into(), json!(self.attr("package")));
        info.insert("resourceName".into(), json!(self.attr("resource-id")));
        info.insert("resourceId".into(), json!(self.attr("resource-id")));
        info.insert(
            "childCount".into(),
            json!(self.snapshot.children(self.id).len()),
        );
        Value::Object(info)
    }

    /// Taps the element's centre.
    pub async fn click(&self) -> Result<(), DeviceError> {
        let c = self.center();
        self.device.click(c.x as f64, c.y as f64).await
    }

    /// Presses the element's centre for half a second.
    pub async fn long_click(&self) -> Result<(), DeviceError> {
        let c = self.center();
        self.device
            .long_click(c.x as f64, c.y as f64, LONG_CLICK)
            .await
    }

    /// Query evaluated with this element as the context node, inside the
    /// same snapshot. Relative paths (`./…`) search beneath the element.
    pub fn xpath(&self, shorthand: &str) -> XPathSelector {
        XPathSelector::new(
            self.device.clone(),
            [shorthand],
            Some(HierarchySource::Element(self.clone())),
        )
    }
}

impl PartialEq for XmlElement {
    fn eq(&self, other: &Self) -> bool {
        self.content_key() == other.content_key()
    }
}

impl Eq for XmlElement {}

impl Hash for XmlElement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_key().hash(state);
    }
}

impl fmt::Debug for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.center();
        write!(f, "<XmlElement [{:?} center:({}, {})]>", self.tag(), c.x, c.y)
    }
}
