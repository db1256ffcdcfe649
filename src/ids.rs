//! Deterministic child-id derivation.
//!
//! A child id is a collision-resistant hash of the parent instance id, the call
//! kind, the callee or event name, the serialized input where one exists, and
//! the per-parent call ordinal. Re-running an orchestrator over the same
//! history therefore yields the same ids in the same order, which is what lets
//! replay match history entries to call sites. The ordinal also makes a
//! compensating re-call (same name, same input) produce a fresh id.

use sha2::{Digest, Sha256};

// Field separator; cannot appear in hex output and is unlikely in user names.
const SEP: char = '\u{1f}';

fn derive(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([SEP as u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub(crate) fn activity_id(parent: &str, function_name: &str, input: &str, seq: u64) -> String {
    derive(&[parent, "activity", function_name, input, &seq.to_string()])
}

pub(crate) fn sub_orchestration_id(parent: &str, function_name: &str, input: &str, seq: u64) -> String {
    derive(&[parent, "sub_orchestration", function_name, input, &seq.to_string()])
}

pub(crate) fn timer_id(parent: &str, seq: u64) -> String {
    derive(&[parent, "timer", &seq.to_string()])
}

pub(crate) fn event_slot_id(parent: &str, event_name: &str, seq: u64) -> String {
    derive(&[parent, "external", event_name, &seq.to_string()])
}
