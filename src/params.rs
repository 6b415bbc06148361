//! Parameter precedence between the client request and the alias configuration
//!
//! Every tunable parameter is resolved into a [`Param`]: an explicit client value always wins,
//! even when it is zero, `false` or empty. A missing (or `null`) client value falls back to the
//! configured default, and when neither side supplies anything the parameter is not sent.
use serde_json::Value;

/// A resolved parameter value together with where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param<T> {
    /// Neither the client nor the configuration supplied a value.
    Unset,
    /// The client supplied this value.
    Explicit(T),
    /// The configuration supplied this value.
    Default(T),
}

impl<T> Default for Param<T> {
    fn default() -> Self {
        Param::Unset
    }
}

impl<T> Param<T> {
    /// Merge a client value with a configured default.
    pub fn merge(client: Option<T>, default: Option<T>) -> Self {
        match (client, default) {
            (Some(v), _) => Param::Explicit(v),
            (None, Some(v)) => Param::Default(v),
            (None, None) => Param::Unset,
        }
    }

    /// Fill an unset parameter with a lower-precedence default.
    pub fn or_default(self, default: Option<T>) -> Self {
        match self {
            Param::Unset => default.map(Param::Default).unwrap_or(Param::Unset),
            other => other,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Param::Unset => None,
            Param::Explicit(v) | Param::Default(v) => Some(v),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Param::Unset => None,
            Param::Explicit(v) | Param::Default(v) => Some(v),
        }
    }
}

impl<T: Copy> Param<T> {
    pub fn get(&self) -> Option<T> {
        self.value().copied()
    }
}

/// Merge a passthrough parameter held as raw JSON. `null` on the client side counts as absent.
pub fn merge_json(client: Option<&Value>, default: Option<&Value>) -> Param<Value> {
    let client = client.filter(|v| !v.is_null()).cloned();
    Param::merge(client, default.cloned())
}
