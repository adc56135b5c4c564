//! The replicated command set and the on-disk log framing.
//!
//! Commands are the only way the tree mutates. Their encoding is a stable
//! self-describing form: serde's external enum tagging names the variant,
//! and every persisted record is length-prefixed so the log file can be
//! re-read one frame at a time after a crash. Apply must stay pure over the
//! command bytes: no wall-clock, no randomness, no host-specific state.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::cluster::NodeInfo;
use crate::value::Value;

/// A committed log entry's application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// `merge == false` replaces the subtree at `path`; `merge == true`
    /// fills gaps only.
    SetKv {
        path: String,
        value: Value,
        merge: bool,
    },
    DeleteKv {
        path: String,
    },
    /// Upserts the member record at `/cluster/nodes/<id>`.
    SetNode {
        node: NodeInfo,
    },
    DeleteNode {
        id: String,
    },
}

impl Command {
    /// Stable self-describing encoding of this command.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("command serializes")
    }

    pub fn decode(src: &[u8]) -> Result<Command, serde_json::Error> {
        serde_json::from_slice(src)
    }
}

/// An error produced while applying a command. Deterministic over the
/// command stream, so every replica records the same one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum ApplyError {
    #[error("not found")]
    NotFound,
    #[error("bad encoding: {0}")]
    BadEncoding(String),
}

impl From<crate::errors::CoordError> for ApplyError {
    fn from(e: crate::errors::CoordError) -> ApplyError {
        match e {
            crate::errors::CoordError::NotFound => ApplyError::NotFound,
            crate::errors::CoordError::BadEncoding(msg) => ApplyError::BadEncoding(msg),
            other => ApplyError::BadEncoding(other.to_string()),
        }
    }
}

impl From<ApplyError> for crate::errors::CoordError {
    fn from(e: ApplyError) -> crate::errors::CoordError {
        match e {
            ApplyError::NotFound => crate::errors::CoordError::NotFound,
            ApplyError::BadEncoding(msg) => crate::errors::CoordError::BadEncoding(msg),
        }
    }
}

/// Result of applying one command. Apply errors are recorded here and
/// returned to the proposer; replicas hit the same error deterministically
/// and keep going.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    pub applied: bool,
    pub error: Option<ApplyError>,
    /// Revision assigned by the FSM to this command.
    pub revision: u64,
}

impl CommandResponse {
    pub fn ok(revision: u64) -> CommandResponse {
        CommandResponse {
            applied: true,
            error: None,
            revision,
        }
    }

    pub fn failed(revision: u64, error: ApplyError) -> CommandResponse {
        CommandResponse {
            applied: false,
            error: Some(error),
            revision,
        }
    }
}

// ── Log framing ───────────────────────────────────────────────────────────────

/// Writes one length-prefixed frame: a little-endian `u32` byte count
/// followed by the payload.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)
}

/// Reads the next frame, or `None` at a clean end of stream. A partial
/// frame (torn final write) also ends the stream rather than erroring, so a
/// crashed node can replay everything before the tear.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    match r.read_exact(&mut payload) {
        Ok(()) => Ok(Some(payload)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeInfo;
    use crate::value::Value;

    #[test]
    fn command_encoding_is_self_describing() {
        let cmd = Command::SetKv {
            path: "/config/index_type".to_string(),
            value: Value::Str("upside_down".into()),
            merge: true,
        };
        let bytes = cmd.encode();
        // External tagging carries the variant name.
        assert!(std::str::from_utf8(&bytes).unwrap().contains("SetKv"));
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn command_encoding_is_stable() {
        let cmd = Command::DeleteNode {
            id: "node2".to_string(),
        };
        assert_eq!(cmd.encode(), cmd.encode());
    }

    #[test]
    fn all_variants_roundtrip() {
        let commands = vec![
            Command::SetKv {
                path: "/a/b".into(),
                value: Value::Int(1),
                merge: false,
            },
            Command::DeleteKv { path: "/a/b".into() },
            Command::SetNode {
                node: NodeInfo::new("node1", ":16060", ":17070", ":18080"),
            },
            Command::DeleteNode { id: "node1".into() },
        ];
        for cmd in commands {
            assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn frames_roundtrip_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").unwrap();
        write_frame(&mut buf, b"second").unwrap();
        write_frame(&mut buf, b"").unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"second");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn torn_final_frame_ends_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"complete").unwrap();
        write_frame(&mut buf, b"torn-away").unwrap();
        buf.truncate(buf.len() - 4);

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"complete");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }
}
