//! Branded ID newtypes for type safety.
//!
//! Controllers and clients are both keyed by strings, but mixing them up is
//! always a bug. Each gets its own newtype so the compiler keeps them apart.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Opaque handle naming one managed endpoint while it is attached.
    ///
    /// Handles are chosen by whoever attaches the endpoint. Ordering is plain
    /// string ordering, which is what `clients.enumerate` sorts by.
    ClientHandle
);

branded_id!(
    /// Identifies one connected controller for the lifetime of its socket.
    ControllerId
);

impl ControllerId {
    /// Allocate a fresh controller ID (`ctl_` + UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("ctl_{}", Uuid::now_v7()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    #[test]
    fn generated_controller_ids_are_unique() {
        let ids: HashSet<ControllerId> = (0..100).map(|_| ControllerId::generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn controller_id_prefix() {
        assert!(ControllerId::generate().as_str().starts_with("ctl_"));
    }

    #[test]
    fn handle_display_matches_inner() {
        let handle = ClientHandle::from("10.0.0.7:51234");
        assert_eq!(handle.to_string(), "10.0.0.7:51234");
        assert_eq!(handle.as_str(), "10.0.0.7:51234");
    }

    #[test]
    fn handle_serializes_transparently() {
        let handle = ClientHandle::from("lab-pc-03");
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(json, "\"lab-pc-03\"");
        let back: ClientHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn handles_order_like_strings() {
        let mut handles = vec![
            ClientHandle::from("b"),
            ClientHandle::from("a"),
            ClientHandle::from("B"),
        ];
        handles.sort();
        let raw: Vec<&str> = handles.iter().map(ClientHandle::as_str).collect();
        assert_eq!(raw, vec!["B", "a", "b"]);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = BTreeMap::new();
        let _ = map.insert(ClientHandle::from("pc1"), 1);
        assert_eq!(map.get("pc1"), Some(&1));
        assert!(map.get("pc2").is_none());
    }

    #[test]
    fn into_inner_returns_string() {
        let id = ControllerId::from("ctl_x");
        assert_eq!(id.into_inner(), "ctl_x");
    }
}
