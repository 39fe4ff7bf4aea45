//! Typed identifiers used across the sync engine.
//!
//! Sync-roots are identified by a random, stable [`SyncRootId`] independent
//! of any catalog row, the same way the rest of this codebase's ancestry
//! keys long-lived entities by a uuid rather than a database-assigned
//! integer. Everything else named in the catalog schema (tasks, local
//! files/folders, uploads, remote files/folders) is keyed by the integer
//! rowid sqlite already hands out, so those ids are thin `i64` newtypes:
//! there is no value in re-deriving a uuid for a row that only ever needs
//! to be unique within one sync-root's catalog.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! uuid_id_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn from_array(b: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(b))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_simple())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

macro_rules! row_id_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

uuid_id_newtype!(SyncRootId);

row_id_newtype!(TaskId);
row_id_newtype!(LocalFileId);
row_id_newtype!(LocalFolderId);
/// Rowid of a `syncfolder` entry — the catalog's integer handle for a
/// sync-root, distinct from the stable [`SyncRootId`] uuid used in config.
row_id_newtype!(SyncId);

/// Server-assigned file id. Unlike the row ids above, this one did cross
/// the wire and so round-trips through `u64`, not `i64`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteFileId(pub u64);

impl fmt::Display for RemoteFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RemoteFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Server-assigned folder id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteFolderId(pub u64);

impl fmt::Display for RemoteFolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RemoteFolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Server-assigned resumable-upload handle; opaque beyond round-tripping it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(pub u64);

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_root_id_roundtrips_through_display() {
        let id = SyncRootId::generate();
        let parsed: SyncRootId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn row_id_displays_as_plain_integer() {
        assert_eq!(TaskId(42).to_string(), "42");
    }
}
