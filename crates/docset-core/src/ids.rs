//! Typed identifiers for every persisted entity.
//!
//! Each id wraps the store-assigned integer key so that a [`TagId`] can
//! never be passed where a [`DocumentId`] is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw store key.
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the underlying key.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifier of a [`DocumentSet`](crate::models::DocumentSet).
    DocumentSetId
);
entity_id!(
    /// Identifier of a [`Document`](crate::models::Document).
    DocumentId
);
entity_id!(
    /// Identifier of a [`Tag`](crate::models::Tag).
    TagId
);
entity_id!(
    /// Identifier of a [`Node`](crate::models::Node).
    NodeId
);
entity_id!(
    /// Identifier of a [`Tree`](crate::models::Tree).
    TreeId
);
entity_id!(
    /// Identifier of a [`Job`](crate::job::Job).
    JobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_raw_integers() {
        let id = DocumentId::new(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");

        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_parse_from_cli_strings() {
        assert_eq!(" 7 ".parse::<JobId>().unwrap(), JobId::new(7));
        assert!("seven".parse::<TreeId>().is_err());
    }

    #[test]
    fn ids_order_by_key() {
        let mut ids = vec![NodeId::new(3), NodeId::new(1), NodeId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
    }
}
