//! Core snap naming and versioning types shared across the client.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod info;

pub use info::{DeltaInfo, DownloadInfo, SnapInfo};

/// A store revision number. Zero means "unset" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i32);

impl Revision {
    pub fn unset() -> Self {
        Revision(0)
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Revision {
    fn from(n: i32) -> Self {
        Revision(n)
    }
}

/// A snap epoch: which generations of the snap can read and write the
/// current data format. The zero epoch is `{"read":[0],"write":[0]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epoch {
    pub read: Vec<u32>,
    pub write: Vec<u32>,
}

impl Default for Epoch {
    fn default() -> Self {
        Epoch {
            read: vec![0],
            write: vec![0],
        }
    }
}

impl Epoch {
    pub fn is_zero(&self) -> bool {
        self.read == [0] && self.write == [0]
    }
}

impl Serialize for Epoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            read: &'a [u32],
            write: &'a [u32],
        }
        Wire {
            read: &self.read,
            write: &self.write,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Epoch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // the store also emits a bare number for simple epochs
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Full { read: Vec<u32>, write: Vec<u32> },
            Simple(u32),
        }
        match Option::<Wire>::deserialize(deserializer)? {
            None => Ok(Epoch::default()),
            Some(Wire::Full { read, write }) => Ok(Epoch { read, write }),
            Some(Wire::Simple(n)) => Ok(Epoch {
                read: vec![n],
                write: vec![n],
            }),
        }
    }
}

/// Split an instance name `name_key` into its snap name and instance key.
pub fn split_instance_name(instance: &str) -> (&str, Option<&str>) {
    match instance.split_once('_') {
        Some((name, key)) => (name, Some(key)),
        None => (instance, None),
    }
}

/// The snap name part of an instance name.
pub fn instance_snap(instance: &str) -> &str {
    split_instance_name(instance).0
}

/// The fully qualified `snap.app` command name.
pub fn join_snap_app(snap: &str, app: &str) -> String {
    if snap == app {
        snap.to_string()
    } else {
        format!("{snap}.{app}")
    }
}
