//! Schema model.
//!
//! Attribute descriptors are a tagged variant, not open inheritance: the
//! diff walker and the codec dispatch on the tag. A schema is itself stored
//! as triples in the `_schema` namespace, so everything here must survive a
//! serde round trip through JSON leaves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CoreError;
use crate::filter::Filter;
use crate::value::Value;

/// Which generator fills an absent attribute on insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultFn {
    Uuid,
    Now,
    Literal,
}

/// Default specification: generator plus optional argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefaultSpec {
    pub func: DefaultFn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl DefaultSpec {
    pub fn uuid() -> Self {
        Self {
            func: DefaultFn::Uuid,
            args: None,
        }
    }

    pub fn now() -> Self {
        Self {
            func: DefaultFn::Now,
            args: None,
        }
    }

    pub fn literal(value: serde_json::Value) -> Self {
        Self {
            func: DefaultFn::Literal,
            args: Some(value),
        }
    }

    /// Produce the concrete value for an absent attribute.
    pub fn materialize(&self) -> Result<Value, CoreError> {
        match self.func {
            DefaultFn::Uuid => Ok(Value::String(Uuid::new_v4().simple().to_string())),
            DefaultFn::Now => Ok(Value::Date(OffsetDateTime::now_utc())),
            DefaultFn::Literal => {
                let args = self.args.as_ref().unwrap_or(&serde_json::Value::Null);
                Value::from_json(args).map_err(|reason| CoreError::ValueMismatch {
                    attribute: "<default>".into(),
                    expected: "literal leaf".into(),
                    found: reason,
                })
            }
        }
    }
}

/// Per-leaf constraints carried by every leaf type (and by sets).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeOptions {
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultSpec>,
    #[serde(
        rename = "enum",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub enumeration: Option<Vec<Value>>,
}

/// Typed attribute descriptor - discriminated union over the leaf types,
/// sets, records, and the `Optional` wrapper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttributeDescriptor {
    Id {
        #[serde(default)]
        options: TypeOptions,
    },
    String {
        #[serde(default)]
        options: TypeOptions,
    },
    Number {
        #[serde(default)]
        options: TypeOptions,
    },
    Boolean {
        #[serde(default)]
        options: TypeOptions,
    },
    Date {
        #[serde(default)]
        options: TypeOptions,
    },
    Set {
        items: Box<AttributeDescriptor>,
        #[serde(default)]
        options: TypeOptions,
    },
    Record {
        fields: BTreeMap<std::string::String, AttributeDescriptor>,
    },
    Optional {
        inner: Box<AttributeDescriptor>,
    },
}

impl AttributeDescriptor {
    /// Id attribute; fills itself with a uuid when the caller omits it.
    pub fn id() -> Self {
        AttributeDescriptor::Id {
            options: TypeOptions {
                default: Some(DefaultSpec::uuid()),
                ..TypeOptions::default()
            },
        }
    }

    pub fn string() -> Self {
        AttributeDescriptor::String {
            options: TypeOptions::default(),
        }
    }

    pub fn number() -> Self {
        AttributeDescriptor::Number {
            options: TypeOptions::default(),
        }
    }

    pub fn boolean() -> Self {
        AttributeDescriptor::Boolean {
            options: TypeOptions::default(),
        }
    }

    pub fn date() -> Self {
        AttributeDescriptor::Date {
            options: TypeOptions::default(),
        }
    }

    pub fn set(items: AttributeDescriptor) -> Self {
        AttributeDescriptor::Set {
            items: Box::new(items),
            options: TypeOptions::default(),
        }
    }

    pub fn record(fields: impl IntoIterator<Item = (&'static str, AttributeDescriptor)>) -> Self {
        AttributeDescriptor::Record {
            fields: fields
                .into_iter()
                .map(|(name, desc)| (name.to_string(), desc))
                .collect(),
        }
    }

    /// Wrap in `Optional`. Idempotent.
    pub fn optional(self) -> Self {
        match self {
            already @ AttributeDescriptor::Optional { .. } => already,
            inner => AttributeDescriptor::Optional {
                inner: Box::new(inner),
            },
        }
    }

    pub fn nullable(mut self) -> Self {
        if let Some(options) = self.options_mut() {
            options.nullable = true;
        }
        self
    }

    pub fn with_default(mut self, spec: DefaultSpec) -> Self {
        if let Some(options) = self.options_mut() {
            options.default = Some(spec);
        }
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        if let Some(options) = self.options_mut() {
            options.enumeration = Some(values);
        }
        self
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, AttributeDescriptor::Optional { .. })
    }

    /// Strip the `Optional` wrapper; the flag says whether one was present.
    pub fn unwrap_optional(&self) -> (&AttributeDescriptor, bool) {
        match self {
            AttributeDescriptor::Optional { inner } => (inner, true),
            other => (other, false),
        }
    }

    /// Tag of the underlying type, looking through `Optional`.
    pub fn type_tag(&self) -> &'static str {
        match self.unwrap_optional().0 {
            AttributeDescriptor::Id { .. } => "id",
            AttributeDescriptor::String { .. } => "string",
            AttributeDescriptor::Number { .. } => "number",
            AttributeDescriptor::Boolean { .. } => "boolean",
            AttributeDescriptor::Date { .. } => "date",
            AttributeDescriptor::Set { .. } => "set",
            AttributeDescriptor::Record { .. } => "record",
            AttributeDescriptor::Optional { .. } => unreachable!("unwrapped"),
        }
    }

    pub fn options(&self) -> Option<&TypeOptions> {
        match self.unwrap_optional().0 {
            AttributeDescriptor::Id { options }
            | AttributeDescriptor::String { options }
            | AttributeDescriptor::Number { options }
            | AttributeDescriptor::Boolean { options }
            | AttributeDescriptor::Date { options }
            | AttributeDescriptor::Set { options, .. } => Some(options),
            _ => None,
        }
    }

    fn options_mut(&mut self) -> Option<&mut TypeOptions> {
        match self {
            AttributeDescriptor::Id { options }
            | AttributeDescriptor::String { options }
            | AttributeDescriptor::Number { options }
            | AttributeDescriptor::Boolean { options }
            | AttributeDescriptor::Date { options }
            | AttributeDescriptor::Set { options, .. } => Some(options),
            AttributeDescriptor::Optional { inner } => inner.options_mut(),
            AttributeDescriptor::Record { .. } => None,
        }
    }

    pub fn set_items(&self) -> Option<&AttributeDescriptor> {
        match self.unwrap_optional().0 {
            AttributeDescriptor::Set { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn record_fields(&self) -> Option<&BTreeMap<std::string::String, AttributeDescriptor>> {
        match self.unwrap_optional().0 {
            AttributeDescriptor::Record { fields } => Some(fields),
            _ => None,
        }
    }

    /// Whether a runtime value's type matches this descriptor's leaf type.
    pub fn accepts_type(&self, value: &Value) -> bool {
        match (self.unwrap_optional().0, value) {
            (_, Value::Null) => true, // nullability is checked separately
            (AttributeDescriptor::Id { .. }, Value::String(_)) => true,
            (AttributeDescriptor::String { .. }, Value::String(_)) => true,
            (AttributeDescriptor::Number { .. }, Value::Number(_)) => true,
            (AttributeDescriptor::Boolean { .. }, Value::Boolean(_)) => true,
            (AttributeDescriptor::Date { .. }, Value::Date(_)) => true,
            _ => false,
        }
    }

    /// Validate a leaf value against type, nullability, and enum.
    pub fn check_value(&self, attribute: &str, value: &Value) -> Result<(), CoreError> {
        let (inner, _) = self.unwrap_optional();
        if value.is_null() {
            let nullable = inner.options().is_some_and(|o| o.nullable);
            if nullable {
                return Ok(());
            }
            return Err(CoreError::ValueMismatch {
                attribute: attribute.to_string(),
                expected: inner.type_tag().to_string(),
                found: "null".into(),
            });
        }
        if !inner.accepts_type(value) {
            return Err(CoreError::ValueMismatch {
                attribute: attribute.to_string(),
                expected: inner.type_tag().to_string(),
                found: value.type_label().to_string(),
            });
        }
        if let Some(allowed) = inner.options().and_then(|o| o.enumeration.as_ref()) {
            if !allowed.contains(value) {
                return Err(CoreError::ValueMismatch {
                    attribute: attribute.to_string(),
                    expected: format!("one of {allowed:?}"),
                    found: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Parse a set-member path segment back into a value of this leaf type.
    pub fn parse_segment(&self, segment: &str) -> Option<Value> {
        match self.unwrap_optional().0 {
            AttributeDescriptor::Id { .. } | AttributeDescriptor::String { .. } => {
                Some(Value::String(segment.to_string()))
            }
            AttributeDescriptor::Number { .. } => {
                segment.parse::<f64>().ok().map(Value::Number)
            }
            AttributeDescriptor::Boolean { .. } => match segment {
                "true" => Some(Value::Boolean(true)),
                "false" => Some(Value::Boolean(false)),
                _ => None,
            },
            AttributeDescriptor::Date { .. } => OffsetDateTime::parse(
                segment,
                &time::format_description::well_known::Rfc3339,
            )
            .ok()
            .map(Value::Date),
            _ => None,
        }
    }
}

/// Where a path lands inside a collection's attribute tree.
#[derive(Clone, Copy, Debug)]
pub enum PathResolution<'a> {
    /// A scalar leaf (id, string, number, boolean, date).
    Leaf(&'a AttributeDescriptor),
    /// The set itself.
    Set(&'a AttributeDescriptor),
    /// One member inside a set; `set` is the set descriptor.
    SetMember { set: &'a AttributeDescriptor },
    /// A record subtree.
    Record(&'a AttributeDescriptor),
    /// Nothing at this path.
    Unknown,
}

/// Access rule: a predicate the post-image must satisfy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub filter: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<std::string::String>,
}

impl Rule {
    pub fn new(filter: Vec<Filter>) -> Self {
        Self {
            filter,
            description: None,
        }
    }
}

/// Named read/write rules of a collection, compared by deep equality in the
/// schema diff.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionRules {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read: BTreeMap<std::string::String, Rule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub write: BTreeMap<std::string::String, Rule>,
}

/// Role definition: an opaque matcher blob compared by deep equality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    #[serde(rename = "match")]
    pub matcher: serde_json::Value,
}

/// One collection: attribute map plus optional rules and permissions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub schema: BTreeMap<std::string::String, AttributeDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<CollectionRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Value>,
}

impl CollectionDef {
    pub fn new(
        schema: impl IntoIterator<Item = (&'static str, AttributeDescriptor)>,
    ) -> Self {
        Self {
            schema: schema
                .into_iter()
                .map(|(name, desc)| (name.to_string(), desc))
                .collect(),
            rules: None,
            permissions: None,
        }
    }

    pub fn with_rules(mut self, rules: CollectionRules) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_permissions(mut self, permissions: serde_json::Value) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.schema.get(name)
    }

    /// Walk a path (without the collection prefix) down the attribute tree.
    pub fn resolve_path(&self, path: &[std::string::String]) -> PathResolution<'_> {
        let Some((first, rest)) = path.split_first() else {
            return PathResolution::Unknown;
        };
        let Some(mut current) = self.schema.get(first.as_str()) else {
            return PathResolution::Unknown;
        };
        let mut rest = rest;
        loop {
            let (inner, _) = current.unwrap_optional();
            if rest.is_empty() {
                return match inner {
                    AttributeDescriptor::Set { .. } => PathResolution::Set(current),
                    AttributeDescriptor::Record { .. } => PathResolution::Record(current),
                    _ => PathResolution::Leaf(current),
                };
            }
            match inner {
                AttributeDescriptor::Record { fields } => {
                    let (next, tail) = rest.split_first().expect("rest non-empty");
                    let Some(child) = fields.get(next.as_str()) else {
                        return PathResolution::Unknown;
                    };
                    current = child;
                    rest = tail;
                }
                AttributeDescriptor::Set { .. } => {
                    return if rest.len() == 1 {
                        PathResolution::SetMember { set: current }
                    } else {
                        PathResolution::Unknown
                    };
                }
                _ => return PathResolution::Unknown,
            }
        }
    }
}

/// The whole schema document: version, collections, roles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub version: u64,
    pub collections: BTreeMap<std::string::String, CollectionDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeMap<std::string::String, RoleDef>>,
}

impl StoreSchema {
    pub fn new(
        version: u64,
        collections: impl IntoIterator<Item = (&'static str, CollectionDef)>,
    ) -> Self {
        Self {
            version,
            collections: collections
                .into_iter()
                .map(|(name, def)| (name.to_string(), def))
                .collect(),
            roles: None,
        }
    }

    pub fn with_roles(
        mut self,
        roles: impl IntoIterator<Item = (&'static str, RoleDef)>,
    ) -> Self {
        self.roles = Some(
            roles
                .into_iter()
                .map(|(name, def)| (name.to_string(), def))
                .collect(),
        );
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.get(name)
    }
}
