//! XPath-based element lookup over hierarchy dumps.
//!
//! - [`compile`] expands shorthand selectors (`"OK"`, `"@id"`, `"%part%"`)
//!   into full XPath.
//! - [`engine`] parses and evaluates XPath against a
//!   [`HierarchySnapshot`](crate::hierarchy::HierarchySnapshot).
//! - [`selector`] combines several expressions into one query whose result is
//!   the intersection of their matches.

pub mod compile;
pub mod engine;
pub mod selector;

pub use compile::{compile, quote_literal};
pub use engine::XPathExpr;
pub use selector::{HierarchySource, XPathSelector};
