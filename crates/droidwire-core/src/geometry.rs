//! Screen geometry helpers shared by selectors, XPath matches and input.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A point in absolute screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle given by its edges, in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Parses the hierarchy dump format `[l,t][r,b]`.
    ///
    /// Any four integers in order are accepted; anything else yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut nums = raw
            .split(|c: char| !(c.is_ascii_digit() || c == '-'))
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<i32>());
        let left = nums.next()?.ok()?;
        let top = nums.next()?.ok()?;
        let right = nums.next()?.ok()?;
        let bottom = nums.next()?.ok()?;
        Some(Self::new(left, top, right, bottom))
    }

    /// Reads a `{left, top, right, bottom}` object as sent by the agent.
    pub fn from_json(value: &Value) -> Option<Self> {
        let edge = |name: &str| value.get(name).and_then(Value::as_i64).map(|v| v as i32);
        Some(Self::new(
            edge("left")?,
            edge("top")?,
            edge("right")?,
            edge("bottom")?,
        ))
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Point at a fractional offset from the top-left corner.
    ///
    /// `(0.5, 0.5)` is the centre.
    pub fn offset(&self, px: f64, py: f64) -> Point {
        Point::new(
            self.left + (self.width() as f64 * px) as i32,
            self.top + (self.height() as f64 * py) as i32,
        )
    }

    pub fn center(&self) -> Point {
        self.offset(0.5, 0.5)
    }

    /// Edges as fractions of the given screen size.
    pub fn percent(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let w = width.max(1) as f64;
        let h = height.max(1) as f64;
        (
            self.left as f64 / w,
            self.top as f64 / h,
            self.right as f64 / w,
            self.bottom as f64 / h,
        )
    }

    /// Overlap of two rectangles. The result is empty (right <= left or
    /// bottom <= top) when they do not overlap.
    pub fn intersect(&self, other: &Bounds) -> Bounds {
        Bounds::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }

    /// Distance from `self` to `other` when `other` lies on the given side and
    /// their projections overlap; `None` otherwise.
    pub fn distance_to(&self, other: &Bounds, side: Side) -> Option<i32> {
        let overlap = self.intersect(other);
        let (projected, dist) = match side {
            Side::Right => (overlap.top < overlap.bottom, other.left - self.right),
            Side::Left => (overlap.top < overlap.bottom, self.left - other.right),
            Side::Up => (overlap.left < overlap.right, self.top - other.bottom),
            Side::Down => (overlap.left < overlap.right, other.top - self.bottom),
        };
        (projected && dist >= 0).then_some(dist)
    }
}

/// Which side of a reference element to search on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
    Up,
    Down,
}

/// Swipe/scroll direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    /// Vertical forward scrolling moves content up.
    pub const FORWARD: Direction = Direction::Up;
    pub const BACKWARD: Direction = Direction::Down;
    pub const HORIZ_FORWARD: Direction = Direction::Left;
    pub const HORIZ_BACKWARD: Direction = Direction::Right;
}
