//! Permission intersection
//!
//! A capability survives the merge only if every responding node grants it.

use serde::{Deserialize, Serialize};

/// Read/write capability flags of a component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub can_read: bool,
    #[serde(default)]
    pub can_write: bool,
}

impl Permissions {
    pub const DENIED: Permissions = Permissions {
        can_read: false,
        can_write: false,
    };

    pub const FULL: Permissions = Permissions {
        can_read: true,
        can_write: true,
    };

    pub fn new(can_read: bool, can_write: bool) -> Self {
        Self {
            can_read,
            can_write,
        }
    }

    pub fn intersect(self, other: Permissions) -> Permissions {
        Permissions {
            can_read: self.can_read && other.can_read,
            can_write: self.can_write && other.can_write,
        }
    }

    /// AND of every set in `all`; an empty input grants nothing.
    pub fn intersect_all<I>(all: I) -> Permissions
    where
        I: IntoIterator<Item = Permissions>,
    {
        let mut iter = all.into_iter();
        match iter.next() {
            Some(first) => iter.fold(first, Permissions::intersect),
            None => Permissions::DENIED,
        }
    }
}

/// AND the `canRead`/`canWrite` flags of raw JSON `permissions` objects
/// across entities.
///
/// Returns `None` when no entity carries a `permissions` object. Once any
/// does, an entity without one, or a missing flag, counts as denied.
pub fn intersect_json<'a, I>(entities: I) -> Option<Permissions>
where
    I: IntoIterator<Item = &'a serde_json::Value>,
{
    let mut any = false;
    let merged = Permissions::intersect_all(entities.into_iter().map(|entity| {
        match entity.get("permissions") {
            Some(permissions) => {
                any = true;
                let flag = |name: &str| {
                    permissions
                        .get(name)
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                };
                Permissions::new(flag("canRead"), flag("canWrite"))
            }
            None => Permissions::DENIED,
        }
    }));
    any.then_some(merged)
}
