//! Identity atoms.
//!
//! ClientId: writer self-identification, tiebreak for stamp ordering.
//! EntityId: `<collection>#<external>` pair addressing one document.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Separator between collection and external id inside an internal entity id.
pub const ENTITY_ID_SEPARATOR: char = '#';

/// Client identifier - non-empty string after trimming.
///
/// Clients name themselves (or take a random identity). Uniqueness across
/// writers is what makes stamp ordering total.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.trim().is_empty() {
            Err(CoreError::InvalidClientId {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    /// Fresh random identity for clients that do not carry one.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({:?})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        ClientId::new(s)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> String {
        id.0
    }
}

/// Validate a caller-supplied external id.
///
/// External ids become the suffix of the internal entity id, so the
/// separator is forbidden inside them.
pub fn validate_external_id(raw: &str) -> Result<(), CoreError> {
    if raw.is_empty() {
        return Err(CoreError::InvalidEntityId {
            raw: raw.to_string(),
            reason: "empty".into(),
        });
    }
    if raw.contains(ENTITY_ID_SEPARATOR) {
        return Err(CoreError::InvalidEntityId {
            raw: raw.to_string(),
            reason: format!("must not contain `{ENTITY_ID_SEPARATOR}`"),
        });
    }
    Ok(())
}

/// Internal entity id: `<collection>#<external>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    collection: String,
    external: String,
}

impl EntityId {
    pub fn new(collection: impl Into<String>, external: impl Into<String>) -> Result<Self, CoreError> {
        let collection = collection.into();
        let external = external.into();
        if collection.is_empty() || collection.contains(ENTITY_ID_SEPARATOR) {
            return Err(CoreError::InvalidInternalEntityId {
                raw: format!("{collection}{ENTITY_ID_SEPARATOR}{external}"),
                reason: "bad collection segment".into(),
            });
        }
        validate_external_id(&external)?;
        Ok(Self {
            collection,
            external,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let Some((collection, external)) = raw.split_once(ENTITY_ID_SEPARATOR) else {
            return Err(CoreError::InvalidInternalEntityId {
                raw: raw.to_string(),
                reason: "missing separator".into(),
            });
        };
        Self::new(collection, external).map_err(|_| CoreError::InvalidInternalEntityId {
            raw: raw.to_string(),
            reason: "bad segment".into(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The external id - what the `id` attribute of the document equals.
    pub fn external(&self) -> &str {
        &self.external
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}#{})", self.collection, self.external)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.collection, ENTITY_ID_SEPARATOR, self.external)
    }
}

impl TryFrom<String> for EntityId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        EntityId::parse(&s)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_rejects_separator() {
        assert!(validate_external_id("a#b").is_err());
        assert!(validate_external_id("").is_err());
        assert!(validate_external_id("plain-id").is_ok());
    }

    #[test]
    fn entity_id_round_trips() {
        let id = EntityId::new("users", "u1").expect("valid id");
        assert_eq!(id.to_string(), "users#u1");
        let parsed = EntityId::parse("users#u1").expect("parses");
        assert_eq!(parsed, id);
        assert_eq!(parsed.external(), "u1");
    }

    #[test]
    fn entity_id_rejects_missing_separator() {
        let err = EntityId::parse("users").expect_err("no separator");
        assert_eq!(err.kind(), "InvalidInternalEntityId");
    }

    #[test]
    fn client_id_rejects_blank() {
        assert!(ClientId::new("  ").is_err());
        assert!(ClientId::new("c1").is_ok());
    }
}
