//! Content hashing for change detection.
//!
//! Each job variant feeds the fields that participate in its identity into a
//! [`FieldHasher`], in declaration order. Two jobs with the same hash are
//! considered identical for reload purposes; any hashed-field difference
//! produces a different digest.

use std::collections::BTreeMap;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::types::JobError;

/// Streaming SHA-256 builder over named fields.
///
/// Every value is written with its field name and a length prefix so that
/// adjacent fields can never collide (`["ab","c"]` vs `["a","bc"]`).
pub struct FieldHasher {
    hasher: Sha256,
}

impl FieldHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn write_raw(&mut self, field: &str, value: &[u8]) {
        self.hasher.update((field.len() as u64).to_be_bytes());
        self.hasher.update(field.as_bytes());
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value);
    }

    pub fn push_str(&mut self, field: &str, value: &str) {
        self.write_raw(field, value.as_bytes());
    }

    pub fn push_opt_str(&mut self, field: &str, value: Option<&str>) {
        match value {
            Some(v) => self.write_raw(field, v.as_bytes()),
            None => self.write_raw(field, b"\0none"),
        }
    }

    pub fn push_bool(&mut self, field: &str, value: bool) {
        self.write_raw(field, if value { b"true" } else { b"false" });
    }

    pub fn push_u64(&mut self, field: &str, value: u64) {
        self.write_raw(field, &value.to_be_bytes());
    }

    pub fn push_i64(&mut self, field: &str, value: i64) {
        self.write_raw(field, &value.to_be_bytes());
    }

    pub fn push_duration(&mut self, field: &str, value: Duration) {
        self.push_u64(field, value.as_nanos() as u64);
    }

    pub fn push_str_slice(&mut self, field: &str, values: &[String]) {
        self.push_u64(field, values.len() as u64);
        for v in values {
            self.write_raw(field, v.as_bytes());
        }
    }

    /// Maps are hashed in key order so insertion order never matters.
    pub fn push_map(&mut self, field: &str, values: &BTreeMap<String, String>) {
        self.push_u64(field, values.len() as u64);
        for (k, v) in values {
            self.write_raw(field, k.as_bytes());
            self.write_raw(field, v.as_bytes());
        }
    }

    /// Hash a loosely-typed annotation value. Only scalars participate;
    /// arrays and objects have no stable string form here and are rejected.
    pub fn push_json(&mut self, field: &str, value: &serde_json::Value) -> Result<(), JobError> {
        match value {
            serde_json::Value::Null => {
                self.write_raw(field, b"\0null");
                Ok(())
            }
            serde_json::Value::Bool(b) => {
                self.push_bool(field, *b);
                Ok(())
            }
            serde_json::Value::Number(n) => {
                self.write_raw(field, n.to_string().as_bytes());
                Ok(())
            }
            serde_json::Value::String(s) => {
                self.push_str(field, s);
                Ok(())
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(JobError::UnsupportedFieldType {
                    field: field.to_string(),
                })
            }
        }
    }

    /// Finish the digest as lower-case hex.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for FieldHasher {
    fn default() -> Self {
        Self::new()
    }
}
