//! Multi-expression XPath queries with optional position filtering.
//!
//! An [`XPathSelector`] holds one or more compiled expressions. A node is a
//! match only if every expression selects it (set intersection, compared by
//! [`ContentKey`]). An optional position filter keeps only matches whose
//! bounding box lies around an expected screen location, which tells apart
//! otherwise identical views.
//!
//! # Example
//!
//! ```no_run
//! use droidwire_core::device::Device;
//!
//! # async fn example(device: Device) -> Result<(), droidwire_core::error::DeviceError> {
//! // a "Settings" label in the lower half of the screen
//! let settings = device.xpath("Settings").position(0.5, 0.8);
//! if settings.exists().await? {
//!     settings.get_last_match().await?.click().await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::device::Device;
use crate::error::DeviceError;
use crate::hierarchy::{ContentKey, HierarchySnapshot, NodeId, XmlElement};
use crate::xpath::compile::compile;
use crate::xpath::engine::XPathExpr;

/// How far, relative to half its size, a box centre may sit from the
/// filter position and still match.
const POSITION_SCALE: f64 = 1.5;

/// Where a query reads the hierarchy from.
#[derive(Debug, Clone)]
pub enum HierarchySource {
    /// Raw dump XML.
    Xml(String),
    /// An already parsed snapshot.
    Snapshot(Arc<HierarchySnapshot>),
    /// A previously matched element, used as the context node.
    Element(XmlElement),
}

impl HierarchySource {
    /// Snapshot and context node to evaluate against.
    fn resolve(&self) -> Result<(Arc<HierarchySnapshot>, NodeId), DeviceError> {
        match self {
            HierarchySource::Xml(xml) => {
                let snapshot = Arc::new(HierarchySnapshot::parse(xml)?);
                let document = snapshot.document();
                Ok((snapshot, document))
            }
            HierarchySource::Snapshot(snapshot) => Ok((snapshot.clone(), snapshot.document())),
            HierarchySource::Element(element) => {
                Ok((element.snapshot().clone(), element.node_id()))
            }
        }
    }
}

impl From<&str> for HierarchySource {
    fn from(xml: &str) -> Self {
        HierarchySource::Xml(xml.to_string())
    }
}

impl From<String> for HierarchySource {
    fn from(xml: String) -> Self {
        HierarchySource::Xml(xml)
    }
}

impl From<Arc<HierarchySnapshot>> for HierarchySource {
    fn from(snapshot: Arc<HierarchySnapshot>) -> Self {
        HierarchySource::Snapshot(snapshot)
    }
}

impl From<XmlElement> for HierarchySource {
    fn from(element: XmlElement) -> Self {
        HierarchySource::Element(element)
    }
}

/// Nodes selected by every expression in `xpaths`, in the document order of
/// the first expression's result.
///
/// Membership is decided by content key, but every node of the first result
/// whose key the other expressions also select is kept, so lookalikes at
/// different places on screen all survive.
pub(crate) fn intersect_nodes(
    xpaths: &[String],
    snapshot: &HierarchySnapshot,
    context: NodeId,
) -> Result<Vec<NodeId>, DeviceError> {
    let mut matched: Option<Vec<NodeId>> = None;
    for xpath in xpaths {
        let ids = XPathExpr::parse(xpath)?.select(snapshot, context)?;
        matched = Some(match matched {
            None => ids,
            Some(prev) => {
                let keys: HashSet<ContentKey> =
                    ids.iter().map(|&id| snapshot.content_key(id)).collect();
                prev.into_iter()
                    .filter(|&id| keys.contains(&snapshot.content_key(id)))
                    .collect()
            }
        });
    }
    Ok(matched.unwrap_or_default())
}

/// Keeps the first node of each content key.
fn dedup_by_content(ids: Vec<NodeId>, snapshot: &HierarchySnapshot) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|&id| seen.insert(snapshot.content_key(id)))
        .collect()
}

/// Like [`intersect_nodes`], deduplicated by content key.
pub(crate) fn match_nodes(
    xpaths: &[String],
    snapshot: &HierarchySnapshot,
    context: NodeId,
) -> Result<Vec<NodeId>, DeviceError> {
    Ok(dedup_by_content(intersect_nodes(xpaths, snapshot, context)?, snapshot))
}

/// Whether the centre of a box given in screen fractions lies close enough
/// to `(px, py)`: within 1.5 times half the box size on each axis.
pub fn within_position(percent: (f64, f64, f64, f64), px: f64, py: f64) -> bool {
    let (left, top, right, bottom) = percent;
    let dx = (px - (left + right) / 2.0).abs();
    let dy = (py - (top + bottom) / 2.0).abs();
    dx <= (right - left) * 0.5 * POSITION_SCALE && dy <= (bottom - top) * 0.5 * POSITION_SCALE
}

/// A query over hierarchy dumps built from one or more shorthand selectors.
#[derive(Debug)]
pub struct XPathSelector {
    device: Device,
    xpaths: Vec<String>,
    source: Option<HierarchySource>,
    position: Option<(f64, f64)>,
    last_source: Mutex<Option<HierarchySource>>,
}

impl XPathSelector {
    /// Compiles each shorthand. With `source` bound, queries read it instead
    /// of dumping the device.
    pub fn new<I, S>(device: Device, shorthands: I, source: Option<HierarchySource>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            device,
            xpaths: shorthands.into_iter().map(|s| compile(s.as_ref())).collect(),
            source,
            position: None,
            last_source: Mutex::new(None),
        }
    }

    /// Adds another criterion that matches must also satisfy.
    pub fn and_xpath(mut self, shorthand: &str) -> Self {
        self.xpaths.push(compile(shorthand));
        self
    }

    /// Keeps only matches located around `(x, y)`, given as fractions of the
    /// screen width and height.
    pub fn position(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }

    /// Binds a hierarchy source used whenever `all` gets none explicitly.
    pub fn with_source(mut self, source: impl Into<HierarchySource>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The compiled expressions.
    pub fn xpaths(&self) -> &[String] {
        &self.xpaths
    }

    /// All matches in the bound source, or in a fresh dump when none is
    /// bound. An empty result is not an error.
    pub async fn all(&self) -> Result<Vec<XmlElement>, DeviceError> {
        self.all_in(None).await
    }

    /// All matches in `source`, overriding any bound source.
    pub async fn all_from(
        &self,
        source: impl Into<HierarchySource>,
    ) -> Result<Vec<XmlElement>, DeviceError> {
        self.all_in(Some(source.into())).await
    }

    async fn all_in(
        &self,
        explicit: Option<HierarchySource>,
    ) -> Result<Vec<XmlElement>, DeviceError> {
        let source = match explicit.or_else(|| self.source.clone()) {
            Some(source) => source,
            None => HierarchySource::Xml(self.device.dump_hierarchy().await?),
        };
        *self.last_source.lock().await = Some(source.clone());
        self.evaluate(&source).await
    }

    async fn evaluate(&self, source: &HierarchySource) -> Result<Vec<XmlElement>, DeviceError> {
        let (snapshot, context) = source.resolve()?;
        let mut ids = intersect_nodes(&self.xpaths, &snapshot, context)?;

        // filter before dedup so identical views at different places stay apart
        if let Some((px, py)) = self.position {
            let window = self.device.window_size().await?;
            ids.retain(|&id| {
                let bounds = snapshot.bounds(id).unwrap_or_default();
                within_position(bounds.percent(window.0, window.1), px, py)
            });
        }
        let elements: Vec<XmlElement> = dedup_by_content(ids, &snapshot)
            .into_iter()
            .map(|id| XmlElement::new(snapshot.clone(), id, self.device.clone()))
            .collect();
        debug!(selector = %self, matches = elements.len(), "xpath evaluated");
        Ok(elements)
    }

    /// Whether anything matches.
    pub async fn exists(&self) -> Result<bool, DeviceError> {
        Ok(!self.all().await?.is_empty())
    }

    /// First match, failing with [`DeviceError::NoMatch`] when there is none.
    pub async fn first(&self) -> Result<XmlElement, DeviceError> {
        self.all()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::NoMatch(self.to_string()))
    }

    /// First match in the source used by the most recent query.
    ///
    /// Fails with [`DeviceError::NoLastSource`] before any query has run and
    /// with [`DeviceError::NoMatch`] when the cached source has no match.
    pub async fn get_last_match(&self) -> Result<XmlElement, DeviceError> {
        let source = self
            .last_source
            .lock()
            .await
            .clone()
            .ok_or(DeviceError::NoLastSource)?;
        self.evaluate(&source)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::NoMatch(self.to_string()))
    }

    /// Clicks the centre of the first match.
    pub async fn click(&self) -> Result<(), DeviceError> {
        self.first().await?.click().await
    }
}

impl fmt::Display for XPathSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XPathSelector({})", self.xpaths.join("|"))
    }
}
