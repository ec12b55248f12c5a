//! Attribute selectors for server-side element lookup.
//!
//! A [`Selector`] describes the criteria an element must satisfy: a fixed set
//! of attribute fields ([`Field`]), a bitmask recording which fields are set,
//! and an ordered chain of nested child/sibling selectors. The agent receives
//! it verbatim as a `UiSelector` description.
//!
//! # Example
//!
//! ```
//! use droidwire_core::selector::Selector;
//!
//! let sel = Selector::new()
//!     .class_name("android.widget.ListView")
//!     .child(Selector::new().text("Settings"));
//!
//! assert_eq!(sel.mask(), 0x10);
//! assert_eq!(sel.relations().len(), 1);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::DeviceError;

/// The kind of value a [`Field`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    Int,
}

impl ValueKind {
    fn name(self) -> &'static str {
        match self {
            ValueKind::Str => "string",
            ValueKind::Bool => "boolean",
            ValueKind::Int => "integer",
        }
    }
}

macro_rules! selector_fields {
    ($( $variant:ident => ($name:literal, $mask:literal, $kind:ident) ),* $(,)?) => {
        /// The attribute fields a [`Selector`] may carry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Field {
            $( $variant, )*
        }

        impl Field {
            /// Every field, in mask order.
            pub const ALL: &'static [Field] = &[ $( Field::$variant, )* ];

            /// Wire name of the field.
            pub fn name(self) -> &'static str {
                match self {
                    $( Field::$variant => $name, )*
                }
            }

            /// Bit assigned to the field in the selector mask.
            pub fn mask(self) -> u32 {
                match self {
                    $( Field::$variant => $mask, )*
                }
            }

            pub fn kind(self) -> ValueKind {
                match self {
                    $( Field::$variant => ValueKind::$kind, )*
                }
            }
        }

        impl FromStr for Field {
            type Err = DeviceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $name => Ok(Field::$variant), )*
                    other => Err(DeviceError::InvalidField(other.to_string())),
                }
            }
        }
    };
}

selector_fields! {
    Text => ("text", 0x01, Str),
    TextContains => ("textContains", 0x02, Str),
    TextMatches => ("textMatches", 0x04, Str),
    TextStartsWith => ("textStartsWith", 0x08, Str),
    ClassName => ("className", 0x10, Str),
    ClassNameMatches => ("classNameMatches", 0x20, Str),
    Description => ("description", 0x40, Str),
    DescriptionContains => ("descriptionContains", 0x80, Str),
    DescriptionMatches => ("descriptionMatches", 0x0100, Str),
    DescriptionStartsWith => ("descriptionStartsWith", 0x0200, Str),
    Checkable => ("checkable", 0x0400, Bool),
    Checked => ("checked", 0x0800, Bool),
    Clickable => ("clickable", 0x1000, Bool),
    LongClickable => ("longClickable", 0x2000, Bool),
    Scrollable => ("scrollable", 0x4000, Bool),
    Enabled => ("enabled", 0x8000, Bool),
    Focusable => ("focusable", 0x01_0000, Bool),
    Focused => ("focused", 0x02_0000, Bool),
    Selected => ("selected", 0x04_0000, Bool),
    PackageName => ("packageName", 0x08_0000, Str),
    PackageNameMatches => ("packageNameMatches", 0x10_0000, Str),
    ResourceId => ("resourceId", 0x20_0000, Str),
    ResourceIdMatches => ("resourceIdMatches", 0x40_0000, Str),
    Index => ("index", 0x80_0000, Int),
    Instance => ("instance", 0x0100_0000, Int),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed selector value.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorValue {
    Str(String),
    Bool(bool),
    Int(i64),
}

impl SelectorValue {
    fn kind(&self) -> ValueKind {
        match self {
            SelectorValue::Str(_) => ValueKind::Str,
            SelectorValue::Bool(_) => ValueKind::Bool,
            SelectorValue::Int(_) => ValueKind::Int,
        }
    }
}

impl From<&str> for SelectorValue {
    fn from(v: &str) -> Self {
        SelectorValue::Str(v.to_string())
    }
}

impl From<String> for SelectorValue {
    fn from(v: String) -> Self {
        SelectorValue::Str(v)
    }
}

impl From<bool> for SelectorValue {
    fn from(v: bool) -> Self {
        SelectorValue::Bool(v)
    }
}

impl From<i64> for SelectorValue {
    fn from(v: i64) -> Self {
        SelectorValue::Int(v)
    }
}

impl From<i32> for SelectorValue {
    fn from(v: i32) -> Self {
        SelectorValue::Int(v as i64)
    }
}

impl From<u32> for SelectorValue {
    fn from(v: u32) -> Self {
        SelectorValue::Int(v as i64)
    }
}

impl fmt::Display for SelectorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorValue::Str(s) => write!(f, "{s:?}"),
            SelectorValue::Bool(b) => write!(f, "{b}"),
            SelectorValue::Int(i) => write!(f, "{i}"),
        }
    }
}

impl Serialize for SelectorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SelectorValue::Str(s) => serializer.serialize_str(s),
            SelectorValue::Bool(b) => serializer.serialize_bool(*b),
            SelectorValue::Int(i) => serializer.serialize_i64(*i),
        }
    }
}

/// How a nested selector relates to the one before it in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Child,
    Sibling,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Child => "child",
            Relation::Sibling => "sibling",
        }
    }
}

/// Declarative element criteria sent to the agent.
///
/// Cloning is deep: nested child/sibling selectors are copied, so a derived
/// selector can be extended without touching the original.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    fields: BTreeMap<Field, SelectorValue>,
    mask: u32,
    relations: Vec<(Relation, Selector)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a field by its wire name.
    ///
    /// Fails with [`DeviceError::InvalidField`] for names outside the fixed
    /// attribute set, and [`DeviceError::InvalidValue`] when the value kind
    /// does not fit the field.
    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<SelectorValue>,
    ) -> Result<&mut Self, DeviceError> {
        let field: Field = key.parse()?;
        self.set_field(field, value)
    }

    /// Assigns a typed field and ORs its bit into the mask.
    pub fn set_field(
        &mut self,
        field: Field,
        value: impl Into<SelectorValue>,
    ) -> Result<&mut Self, DeviceError> {
        let value = value.into();
        if value.kind() != field.kind() {
            return Err(DeviceError::InvalidValue {
                field: field.name(),
                expected: field.kind().name(),
            });
        }
        self.fields.insert(field, value);
        self.mask |= field.mask();
        Ok(self)
    }

    /// Clears a field and its mask bit. No-op when the field is not set.
    pub fn unset(&mut self, field: Field) -> &mut Self {
        if self.fields.remove(&field).is_some() {
            self.mask &= !field.mask();
        }
        self
    }

    pub fn get(&self, field: Field) -> Option<&SelectorValue> {
        self.fields.get(&field)
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn relations(&self) -> &[(Relation, Selector)] {
        &self.relations
    }

    /// Appends a nested child selector.
    pub fn add_child(&mut self, criteria: Selector) -> &mut Self {
        self.relations.push((Relation::Child, criteria));
        self
    }

    /// Appends a nested sibling selector.
    pub fn add_sibling(&mut self, criteria: Selector) -> &mut Self {
        self.relations.push((Relation::Sibling, criteria));
        self
    }

    pub fn child(mut self, criteria: Selector) -> Self {
        self.add_child(criteria);
        self
    }

    pub fn sibling(mut self, criteria: Selector) -> Self {
        self.add_sibling(criteria);
        self
    }

    /// Sets the instance on the innermost scope built so far: the last nested
    /// selector if there is one, otherwise this selector.
    pub fn update_instance(&mut self, instance: u32) -> &mut Self {
        match self.relations.last_mut() {
            Some((_, nested)) => nested.put_instance(instance),
            None => self.put_instance(instance),
        }
        self
    }

    fn put_instance(&mut self, instance: u32) {
        self.fields.insert(Field::Instance, SelectorValue::Int(instance as i64));
        self.mask |= Field::Instance.mask();
    }

    /// Wire representation sent to the agent.
    pub fn to_json(&self) -> serde_json::Value {
        // Serializing a map of strings, bools and integers cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn with(mut self, field: Field, value: SelectorValue) -> Self {
        self.mask |= field.mask();
        self.fields.insert(field, value);
        self
    }

    pub fn text(self, v: impl Into<String>) -> Self {
        self.with(Field::Text, SelectorValue::Str(v.into()))
    }

    pub fn text_contains(self, v: impl Into<String>) -> Self {
        self.with(Field::TextContains, SelectorValue::Str(v.into()))
    }

    pub fn text_matches(self, v: impl Into<String>) -> Self {
        self.with(Field::TextMatches, SelectorValue::Str(v.into()))
    }

    pub fn text_starts_with(self, v: impl Into<String>) -> Self {
        self.with(Field::TextStartsWith, SelectorValue::Str(v.into()))
    }

    pub fn class_name(self, v: impl Into<String>) -> Self {
        self.with(Field::ClassName, SelectorValue::Str(v.into()))
    }

    pub fn class_name_matches(self, v: impl Into<String>) -> Self {
        self.with(Field::ClassNameMatches, SelectorValue::Str(v.into()))
    }

    pub fn description(self, v: impl Into<String>) -> Self {
        self.with(Field::Description, SelectorValue::Str(v.into()))
    }

    pub fn description_contains(self, v: impl Into<String>) -> Self {
        self.with(Field::DescriptionContains, SelectorValue::Str(v.into()))
    }

    pub fn description_matches(self, v: impl Into<String>) -> Self {
        self.with(Field::DescriptionMatches, SelectorValue::Str(v.into()))
    }

    pub fn description_starts_with(self, v: impl Into<String>) -> Self {
        self.with(Field::DescriptionStartsWith, SelectorValue::Str(v.into()))
    }

    pub fn checkable(self, v: bool) -> Self {
        self.with(Field::Checkable, SelectorValue::Bool(v))
    }

    pub fn checked(self, v: bool) -> Self {
        self.with(Field::Checked, SelectorValue::Bool(v))
    }

    pub fn clickable(self, v: bool) -> Self {
        self.with(Field::Clickable, SelectorValue::Bool(v))
    }

    pub fn long_clickable(self, v: bool) -> Self {
        self.with(Field::LongClickable, SelectorValue::Bool(v))
    }

    pub fn scrollable(self, v: bool) -> Self {
        self.with(Field::Scrollable, SelectorValue::Bool(v))
    }

    pub fn enabled(self, v: bool) -> Self {
        self.with(Field::Enabled, SelectorValue::Bool(v))
    }

    pub fn focusable(self, v: bool) -> Self {
        self.with(Field::Focusable, SelectorValue::Bool(v))
    }

    pub fn focused(self, v: bool) -> Self {
        self.with(Field::Focused, SelectorValue::Bool(v))
    }

    pub fn selected(self, v: bool) -> Self {
        self.with(Field::Selected, SelectorValue::Bool(v))
    }

    pub fn package_name(self, v: impl Into<String>) -> Self {
        self.with(Field::PackageName, SelectorValue::Str(v.into()))
    }

    pub fn package_name_matches(self, v: impl Into<String>) -> Self {
        self.with(Field::PackageNameMatches, SelectorValue::Str(v.into()))
    }

    pub fn resource_id(self, v: impl Into<String>) -> Self {
        self.with(Field::ResourceId, SelectorValue::Str(v.into()))
    }

    pub fn resource_id_matches(self, v: impl Into<String>) -> Self {
        self.with(Field::ResourceIdMatches, SelectorValue::Str(v.into()))
    }

    pub fn index(self, v: u32) -> Self {
        self.with(Field::Index, SelectorValue::Int(v as i64))
    }

    pub fn instance(self, v: u32) -> Self {
        self.with(Field::Instance, SelectorValue::Int(v as i64))
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 3))?;
        map.serialize_entry("mask", &self.mask)?;
        for (field, value) in &self.fields {
            map.serialize_entry(field.name(), value)?;
        }
        let kinds: Vec<&str> = self.relations.iter().map(|(r, _)| r.as_str()).collect();
        let nested: Vec<&Selector> = self.relations.iter().map(|(_, s)| s).collect();
        map.serialize_entry("childOrSibling", &kinds)?;
        map.serialize_entry("childOrSiblingSelector", &nested)?;
        map.end()
    }
}

/// Debug form, omitting the mask and empty relation lists.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect();
        if !self.relations.is_empty() {
            let kinds: Vec<&str> = self.relations.iter().map(|(r, _)| r.as_str()).collect();
            parts.push(format!("childOrSibling={kinds:?}"));
            let nested: Vec<String> = self.relations.iter().map(|(_, s)| s.to_string()).collect();
            parts.push(format!("childOrSiblingSelector=[{}]", nested.join(", ")));
        }
        write!(f, "Selector [{}]", parts.join(", "))
    }
}
