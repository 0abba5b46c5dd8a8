//! On-disk record format.
//!
//! Each checkpoint file holds one JSON envelope. The snapshot is stored as a
//! JSON string in `payload`; `length` and `checksum` (BLAKE3, hex) cover the
//! payload bytes so truncation and bit rot are detected before decoding.

use pipeline::{CheckpointRecord, RunId, RunSnapshot, Stage, Timestamp};
use serde::{Deserialize, Serialize};

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub schema_version: u32,
    pub run_id: RunId,
    pub stage: Stage,
    pub sequence: u32,
    pub created_at: Timestamp,
    pub length: usize,
    pub checksum: String,
    pub payload: String,
}

impl Envelope {
    /// Wraps a record for writing.
    pub fn seal(record: &CheckpointRecord) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(&record.state)?;
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            run_id: record.run_id,
            stage: record.stage,
            sequence: record.sequence,
            created_at: record.created_at,
            length: payload.len(),
            checksum: blake3::hash(payload.as_bytes()).to_hex().to_string(),
            payload,
        })
    }

    /// Decodes raw file bytes, verifying every integrity marker.
    ///
    /// The error string explains why the record is unusable.
    pub fn open(bytes: &[u8], run_id: RunId, sequence: u32) -> Result<CheckpointRecord, String> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| format!("unreadable envelope: {e}"))?;

        if envelope.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                envelope.schema_version
            ));
        }
        if envelope.run_id != run_id || envelope.sequence != sequence {
            return Err(format!(
                "envelope identifies run {} sequence {}",
                envelope.run_id, envelope.sequence
            ));
        }
        if envelope.payload.len() != envelope.length {
            return Err(format!(
                "payload length {} does not match recorded length {}",
                envelope.payload.len(),
                envelope.length
            ));
        }
        let checksum = blake3::hash(envelope.payload.as_bytes()).to_hex();
        if checksum.as_str() != envelope.checksum {
            return Err("payload checksum mismatch".to_string());
        }

        let state: RunSnapshot = serde_json::from_str(&envelope.payload)
            .map_err(|e| format!("undecodable snapshot: {e}"))?;
        Ok(CheckpointRecord {
            run_id: envelope.run_id,
            stage: envelope.stage,
            sequence: envelope.sequence,
            created_at: envelope.created_at,
            state,
        })
    }
}

/// `<sequence:06>-<stage>.json`
pub(crate) fn file_name(sequence: u32, stage: Stage) -> String {
    format!("{sequence:06}-{}.json", stage.as_str())
}

/// Inverse of [`file_name`]; `None` for foreign files.
pub(crate) fn parse_file_name(name: &str) -> Option<(u32, Stage)> {
    let stem = name.strip_suffix(".json")?;
    let (sequence, stage) = stem.split_once('-')?;
    if sequence.len() < 6 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((sequence.parse().ok()?, Stage::parse(stage)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CheckpointRecord {
        CheckpointRecord {
            run_id: RunId::new_random(),
            stage: Stage::Design,
            sequence: 3,
            created_at: Timestamp::now(),
            state: RunSnapshot::new("build a todo app"),
        }
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(file_name(7, Stage::PhaseExpansion), "000007-phase_expansion.json");
        assert_eq!(
            parse_file_name("000007-phase_expansion.json"),
            Some((7, Stage::PhaseExpansion))
        );
        assert_eq!(parse_file_name("7-design.json"), None);
        assert_eq!(parse_file_name("000001-deploy.json"), None);
        assert_eq!(parse_file_name(".tmpX1y2"), None);
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let record = record();
        let mut envelope = Envelope::seal(&record).unwrap();
        envelope.payload = envelope.payload.replace("todo", "tada");
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let reason = Envelope::open(&bytes, record.run_id, 3).unwrap_err();
        assert!(reason.contains("checksum"), "{reason}");
    }

    #[test]
    fn truncated_payload_fails_length() {
        let record = record();
        let mut envelope = Envelope::seal(&record).unwrap();
        envelope.payload.pop();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let reason = Envelope::open(&bytes, record.run_id, 3).unwrap_err();
        assert!(reason.contains("length"), "{reason}");
    }

    #[test]
    fn future_schema_is_rejected() {
        let record = record();
        let mut envelope = Envelope::seal(&record).unwrap();
        envelope.schema_version = 2;
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(Envelope::open(&bytes, record.run_id, 3)
            .unwrap_err()
            .contains("schema version"));
    }

    #[test]
    fn intact_envelope_opens() {
        let record = record();
        let bytes = serde_json::to_vec(&Envelope::seal(&record).unwrap()).unwrap();
        assert_eq!(Envelope::open(&bytes, record.run_id, 3).unwrap(), record);
    }
}
