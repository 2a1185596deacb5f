//! Tamper-evident audit log.
//!
//! Every privileged decision the driver makes (invocation, cost-cap
//! rejection, ACL violation summary) is appended to a single global hash
//! chain: each record's hash covers the previous record's hash plus the
//! canonical encoding of its own event, and an HMAC over the hash proves the
//! chain was produced by a holder of the shared secret. Altering, deleting,
//! reordering, or truncating history is detectable from the first affected
//! record onward.
//!
//! # File format
//!
//! Append-only, newline-delimited JSON, one record per line:
//!
//! ```text
//! {"event": <opaque>, "prev": "<64-hex>" | null, "hmac": "<64-hex>", "hash": "<64-hex>"}
//! ```
//!
//! Readers must process lines in file order; there is no index.
//!
//! # Concurrency
//!
//! The chain head is the single most contended piece of shared state in the
//! process. It is owned by the log and guarded by a mutex, so concurrent
//! appenders serialize on it and cannot race on computing the link hash.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, trace};

use crate::cost::RemainingBudget;
use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

/// Structured payload recorded for every sandboxed invocation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationEvent {
    /// When the invocation was decided.
    pub timestamp: DateTime<Utc>,
    /// Tool the invocation was billed to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// The command as requested by the caller.
    pub command: Vec<String>,
    /// Reserved cost in USD-micros.
    pub cost_usd_micros: u64,
    /// Reserved cost in tokens.
    pub cost_tokens: u64,
    /// Whether the invocation was allowed and completed.
    pub success: bool,
    /// Budget snapshot after the cost-cap decision, if the tool is capped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<RemainingBudget>,
}

/// One persisted line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Opaque event payload.
    pub event: serde_json::Value,
    /// Hex hash of the previous record, or `None` for the first record.
    pub prev: Option<String>,
    /// HMAC-SHA256 over this record's hash, keyed with the shared secret.
    pub hmac: String,
    /// SHA-256 link hash: `SHA256(prev_hex_bytes || canonical_json(event))`.
    pub hash: String,
}

/// Append-only hash-chained audit log backed by a JSONL file.
pub struct AuditLog {
    path: PathBuf,
    secret: Vec<u8>,
    head: Mutex<Option<String>>,
}

impl AuditLog {
    /// Opens (or prepares to create) the log at `path`.
    ///
    /// If the file already exists, the chain head is recovered from its last
    /// record so new appends extend the existing chain.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Read` if an existing file cannot be read.
    #[instrument(skip(secret), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, secret: Vec<u8>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        let head = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| AuditError::Read {
                path: path.clone(),
                source: e,
            })?;
            last_hash(&content)
        } else {
            None
        };

        debug!(resumed = head.is_some(), "Audit log opened");
        Ok(Self {
            path,
            secret,
            head: Mutex::new(head),
        })
    }

    /// Appends an event to the chain and returns the new chain head.
    ///
    /// The head lock is held across link computation and the file write, so
    /// records land in the file in chain order.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Encode` if the event cannot be canonicalized, or
    /// `AuditError::Write` if the record cannot be persisted. On write
    /// failure the in-memory head is left unchanged.
    #[instrument(skip(self, event))]
    pub fn append(&self, event: &impl Serialize) -> Result<String, AuditError> {
        // Canonicalize through Value so object keys are sorted regardless of
        // struct field order.
        let event = serde_json::to_value(event)?;
        let canonical = serde_json::to_vec(&event)?;

        let mut head = self.head.lock().unwrap_or_else(|e| e.into_inner());

        let link = link_hash(head.as_deref(), &canonical);
        let tag = hmac_hex(&self.secret, &link);

        let record = AuditRecord {
            event,
            prev: head.clone(),
            hmac: tag,
            hash: link.clone(),
        };
        let line = serde_json::to_string(&record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Write {
                path: self.path.clone(),
                source: e,
            })?;

        writeln!(file, "{line}").map_err(|e| AuditError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        file.flush().map_err(|e| AuditError::Write {
            path: self.path.clone(),
            source: e,
        })?;

        *head = Some(link.clone());
        trace!(hash = %link, "Audit record appended");
        Ok(link)
    }

    /// Replays the whole log and reports whether the chain is intact.
    ///
    /// In addition to the per-record checks of [`verify_file`], the last
    /// record on disk must match the in-memory chain head. Truncating
    /// records off the tail leaves a self-consistent file, so only the live
    /// head can expose it.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Read` only if the file cannot be read at all;
    /// malformed or tampered records yield `Ok(false)`.
    pub fn verify(&self) -> Result<bool, AuditError> {
        if !verify_file(&self.path, &self.secret)? {
            return Ok(false);
        }

        let disk_head = if self.path.exists() {
            let content = fs::read_to_string(&self.path).map_err(|e| AuditError::Read {
                path: self.path.clone(),
                source: e,
            })?;
            last_hash(&content)
        } else {
            None
        };

        Ok(disk_head == self.chain_head())
    }

    /// Returns the current chain head, if any record has been appended.
    #[must_use]
    pub fn chain_head(&self) -> Option<String> {
        self.head.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("head", &self.chain_head())
            .finish_non_exhaustive()
    }
}

/// Verifies a log file against a secret without constructing an `AuditLog`.
///
/// Walks the file in order, recomputing each record's link hash from the
/// stored `prev` and `event`, and its HMAC from the secret. The first
/// disagreement in `prev`, `hash`, or `hmac` makes the whole chain invalid
/// from that record forward, so verification stops there.
///
/// A missing file verifies trivially (an empty chain is intact).
///
/// # Errors
///
/// Returns `AuditError::Read` if the file exists but cannot be read.
#[instrument(skip(secret), fields(path = %path.as_ref().display()))]
pub fn verify_file(path: impl AsRef<Path>, secret: &[u8]) -> Result<bool, AuditError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(true);
    }

    let content = fs::read_to_string(path).map_err(|e| AuditError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut expected_prev: Option<String> = None;

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let Ok(record) = serde_json::from_str::<AuditRecord>(line) else {
            debug!(index, "Unparseable audit record");
            return Ok(false);
        };

        if record.prev != expected_prev {
            debug!(index, "Chain break: prev does not match prior hash");
            return Ok(false);
        }

        let Ok(canonical) = serde_json::to_vec(&record.event) else {
            return Ok(false);
        };
        let link = link_hash(record.prev.as_deref(), &canonical);
        if link != record.hash {
            debug!(index, "Chain break: recomputed hash mismatch");
            return Ok(false);
        }

        if hmac_hex(secret, &link) != record.hmac {
            debug!(index, "Chain break: HMAC mismatch");
            return Ok(false);
        }

        expected_prev = Some(record.hash);
    }

    Ok(true)
}

/// Computes `SHA256(prev_hex_bytes || canonical)` as lowercase hex.
fn link_hash(prev: Option<&str>, canonical: &[u8]) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev {
        hasher.update(prev.as_bytes());
    }
    hasher.update(canonical);
    hex_encode(&hasher.finalize())
}

/// Computes `HMAC-SHA256(secret, link_hex_bytes)` as lowercase hex.
fn hmac_hex(secret: &[u8], link: &str) -> String {
    // Allow expect here: HMAC-SHA256 accepts keys of any length, so
    // new_from_slice cannot fail.
    #[allow(clippy::expect_used)]
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(link.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Extracts the `hash` field of the last non-empty line, if any.
fn last_hash(content: &str) -> Option<String> {
    content
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<AuditRecord>(l).ok())
        .map(|r| r.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        (dir, path)
    }

    #[test]
    fn test_append_links_records() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();

        let h1 = log.append(&json!({"op": "one"})).unwrap();
        let h2 = log.append(&json!({"op": "two"})).unwrap();
        assert_ne!(h1, h2);
        assert_eq!(log.chain_head(), Some(h2.clone()));

        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<AuditRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prev, None);
        assert_eq!(records[1].prev, Some(h1));
        assert_eq!(records[1].hash, h2);
    }

    #[test]
    fn test_verify_intact_chain() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();

        for i in 0..5 {
            log.append(&json!({"seq": i})).unwrap();
        }
        assert!(log.verify().unwrap());
    }

    #[test]
    fn test_verify_empty_or_missing_log() {
        let (_dir, path) = temp_log();
        assert!(verify_file(&path, b"secret").unwrap());

        fs::write(&path, "").unwrap();
        assert!(verify_file(&path, b"secret").unwrap());
    }

    #[test]
    fn test_verify_detects_event_tampering() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();
        log.append(&json!({"op": "one", "n": 1})).unwrap();
        log.append(&json!({"op": "two", "n": 2})).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"one\"", "\"eno\"", 1);
        fs::write(&path, tampered).unwrap();

        assert!(!verify_file(&path, b"secret").unwrap());
    }

    #[test]
    fn test_verify_detects_wrong_secret() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();
        log.append(&json!({"op": "one"})).unwrap();

        assert!(!verify_file(&path, b"other-secret").unwrap());
    }

    #[test]
    fn test_verify_detects_deleted_record() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();
        log.append(&json!({"seq": 0})).unwrap();
        log.append(&json!({"seq": 1})).unwrap();
        log.append(&json!({"seq": 2})).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();

        assert!(!verify_file(&path, b"secret").unwrap());
    }

    #[test]
    fn test_canonical_encoding_is_key_order_independent() {
        let a = serde_json::to_vec(&json!({"b": 2, "a": 1})).unwrap();
        let b = serde_json::to_vec(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(a, b);

        assert_eq!(
            link_hash(None, &a),
            link_hash(None, &b),
        );
    }

    #[test]
    fn test_reopen_resumes_chain() {
        let (_dir, path) = temp_log();
        let h1 = {
            let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();
            log.append(&json!({"seq": 0})).unwrap()
        };

        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();
        assert_eq!(log.chain_head(), Some(h1.clone()));

        log.append(&json!({"seq": 1})).unwrap();
        assert!(log.verify().unwrap());

        let content = fs::read_to_string(&path).unwrap();
        let second: AuditRecord = serde_json::from_str(content.lines().nth(1).unwrap()).unwrap();
        assert_eq!(second.prev, Some(h1));
    }

    #[test]
    fn test_invocation_event_round_trip() {
        let event = InvocationEvent {
            timestamp: Utc::now(),
            tool_id: Some("search".to_string()),
            command: vec!["ls".to_string(), "/etc".to_string()],
            cost_usd_micros: 500,
            cost_tokens: 100,
            success: true,
            remaining_budget: None,
        };

        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, b"secret".to_vec()).unwrap();
        log.append(&event).unwrap();
        assert!(log.verify().unwrap());
    }
}
