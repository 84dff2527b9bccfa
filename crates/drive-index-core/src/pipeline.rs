//! Record validation and transformation.
//!
//! Two entry points, one per direction:
//!
//! - [`process_for_index`] runs when a source file is being indexed. A
//!   rejection is a policy outcome, not an error: the caller removes any
//!   previously indexed record at that URL.
//! - [`process_for_write`] runs before a record is written back to a source
//!   (or into a helper table). Rejection is surfaced as
//!   [`IndexError::Validation`], and the `serialize` hook produces the
//!   stored form.

use serde_json::Value;
use tracing::warn;

use crate::error::{IndexError, Result};
use crate::table_def::TableDef;

/// Outcome of running a payload through a table's index pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Accepted(Value),
    Rejected(String),
}

fn check(def: &TableDef, value: &Value) -> std::result::Result<(), String> {
    if !value.is_object() {
        return Err("record is not a JSON object".to_string());
    }
    if let Some(validate) = def.validate_fn() {
        match validate(value) {
            Ok(true) => {}
            Ok(false) => return Err("validator returned false".to_string()),
            Err(e) => return Err(format!("validator failed: {}", e)),
        }
    }
    Ok(())
}

fn preprocess(def: &TableDef, value: Value) -> Value {
    match def.preprocess_fn().and_then(|f| f(&value)) {
        Some(replacement) => replacement,
        None => value,
    }
}

/// Validate then preprocess a decoded source file.
pub fn process_for_index(def: &TableDef, value: Value) -> Processed {
    match check(def, &value) {
        Ok(()) => Processed::Accepted(preprocess(def, value)),
        Err(reason) => {
            warn!(table = def.name(), %reason, "record rejected");
            Processed::Rejected(reason)
        }
    }
}

/// Validate, preprocess and serialize a record on its way to storage.
pub fn process_for_write(def: &TableDef, value: Value) -> Result<Value> {
    check(def, &value).map_err(|reason| {
        IndexError::Validation(format!("The record did not pass validation: {}", reason))
    })?;
    let value = preprocess(def, value);
    Ok(match def.serialize_fn().and_then(|f| f(&value)) {
        Some(serialized) => serialized,
        None => value,
    })
}

/// Decode raw file bytes into JSON. Undecodable payloads are rejected the
/// same way a failing validator would reject them.
pub fn decode_payload(bytes: &[u8]) -> std::result::Result<Value, String> {
    serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {}", e))
}
