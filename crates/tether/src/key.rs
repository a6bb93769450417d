//! Action keys.
//!
//! Every piece of coordination state is partitioned by an [`ActionKey`].
//! Two calls with equal keys interact (they share locks, queues, expiry
//! timestamps and revisions); two calls with different keys never do.
//!
//! Keys are a closed set of shapes with structural equality:
//!
//! - [`ActionKey::Name`] - a plain string (`"save-profile"`)
//! - [`ActionKey::Tag`] - an enum discriminant (`Screen::Settings`)
//! - [`ActionKey::Tuple`] - a tuple of primitives (`("like", 42)`)
//!
//! ```ignore
//! use tether::ActionKey;
//!
//! let a: ActionKey = "refresh-feed".into();
//! let b: ActionKey = ("like", 42_i64).into();
//! let c = ActionKey::tag("Screen", "Settings");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// One primitive component of a tuple key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

/// Identity of one logical operation family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKey {
    /// A plain string key.
    Name(String),
    /// An enum variant, identified by its type and variant names.
    Tag {
        kind: String,
        variant: String,
    },
    /// A tuple of primitive values.
    Tuple(Vec<KeyPart>),
}

impl ActionKey {
    pub fn name(name: impl Into<String>) -> Self {
        ActionKey::Name(name.into())
    }

    pub fn tag(kind: impl Into<String>, variant: impl Into<String>) -> Self {
        ActionKey::Tag {
            kind: kind.into(),
            variant: variant.into(),
        }
    }

    pub fn tuple<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        ActionKey::Tuple(parts.into_iter().map(Into::into).collect())
    }

    /// Stable string form, used as the map key in persisted revision snapshots.
    pub fn to_storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKey::Name(name) => write!(f, "{name}"),
            ActionKey::Tag { kind, variant } => write!(f, "{kind}::{variant}"),
            ActionKey::Tuple(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&str> for ActionKey {
    fn from(value: &str) -> Self {
        ActionKey::Name(value.to_owned())
    }
}

impl From<String> for ActionKey {
    fn from(value: String) -> Self {
        ActionKey::Name(value)
    }
}

impl From<&ActionKey> for ActionKey {
    fn from(value: &ActionKey) -> Self {
        value.clone()
    }
}

impl<A, B> From<(A, B)> for ActionKey
where
    A: Into<KeyPart>,
    B: Into<KeyPart>,
{
    fn from((a, b): (A, B)) -> Self {
        ActionKey::Tuple(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for ActionKey
where
    A: Into<KeyPart>,
    B: Into<KeyPart>,
    C: Into<KeyPart>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        ActionKey::Tuple(vec![a.into(), b.into(), c.into()])
    }
}
