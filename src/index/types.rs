//! Typed row types for the Data Index schema (`spec.md` §3/§6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Physical presence state of a [`FileCopy`] on a [`Node`].
///
/// Encoded in the `filecopy.state` column as a single character:
/// `H`ealthy, `M`issing, `X`=corrupt, `N`ot-present-but-expected
/// (Suspect), `Y`=released-for-deletion, `-`=removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyState {
    Healthy,
    Suspect,
    Corrupt,
    Missing,
    Released,
    Removed,
}

impl CopyState {
    pub fn as_char(self) -> char {
        match self {
            CopyState::Healthy => 'H',
            CopyState::Missing => 'M',
            CopyState::Corrupt => 'X',
            CopyState::Suspect => 'N',
            CopyState::Released => 'Y',
            CopyState::Removed => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'H' => CopyState::Healthy,
            'M' => CopyState::Missing,
            'X' => CopyState::Corrupt,
            'N' => CopyState::Suspect,
            'Y' => CopyState::Released,
            '-' => CopyState::Removed,
            _ => return None,
        })
    }
}

/// Storage role tag carried by a [`Node`]; only `Archive` nodes count
/// toward the two-copies-before-delete rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Archive,
    Field,
    Transport,
    Unset,
}

impl StorageType {
    pub fn as_char(self) -> char {
        match self {
            StorageType::Archive => 'A',
            StorageType::Field => 'F',
            StorageType::Transport => 'T',
            StorageType::Unset => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'A' => StorageType::Archive,
            'F' => StorageType::Field,
            'T' => StorageType::Transport,
            '-' => StorageType::Unset,
            _ => return None,
        })
    }
}

/// Logical grouping of files identified by a path prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acquisition {
    pub name: String,
}

/// A file registered under an [`Acquisition`]. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub acq_name: String,
    pub name: String,
    pub size_b: i64,
    /// 128-bit MD5 digest.
    pub md5sum: [u8; 16],
    pub registered: DateTime<Utc>,
}

impl File {
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.acq_name, self.name)
    }
}

/// The physical presence of a [`File`] on a [`Node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCopy {
    pub id: i64,
    pub file_id: i64,
    pub node_name: String,
    pub state: CopyState,
    pub has_file: bool,
    pub size_b: i64,
    pub last_update: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
}

/// A filesystem root on a specific host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub group_name: String,
    pub active: bool,
    pub io_class: String,
    pub storage_type: StorageType,
    pub root: String,
    pub username: Option<String>,
    pub address: Option<String>,
    pub auto_import: bool,
    pub auto_verify: bool,
    pub avail_gb: Option<f64>,
    pub min_avail_gb: Option<f64>,
    pub max_total_gb: Option<f64>,
    pub daemon_host: String,
    pub io_config: Option<JsonValue>,
}

/// A named collection of [`Node`]s; the destination unit for transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub io_class: String,
}

/// A pending request to import one path, or scan a subtree, on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub id: i64,
    pub path: String,
    pub node_name: String,
    pub recurse: bool,
    pub register_new: bool,
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
}

/// A pending request to obtain a file from a source node onto a
/// destination group (the "ArchiveFileCopyRequest", AFCR).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRequest {
    pub id: i64,
    pub file_id: i64,
    pub group_to: String,
    pub node_from: String,
    pub target_node: Option<String>,
    pub completed: bool,
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
    pub n_requests: i32,
    pub transfer_started: Option<DateTime<Utc>>,
    pub transfer_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_state_round_trips_through_its_db_encoding() {
        for state in [
            CopyState::Healthy,
            CopyState::Suspect,
            CopyState::Corrupt,
            CopyState::Missing,
            CopyState::Released,
            CopyState::Removed,
        ] {
            let c = state.as_char();
            assert_eq!(CopyState::from_char(c), Some(state));
        }
    }

    #[test]
    fn storage_type_rejects_unknown_codes() {
        assert!(StorageType::from_char('Q').is_none());
    }
}
