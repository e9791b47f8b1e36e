//! Diffing the desired nomination relation against the stored one.

use std::collections::BTreeSet;

use super::predicate::matches;
use crate::domain::{DataCandidate, InputCriteria, Nomination, NominationKey};

/// Rows to insert and delete so the stored relation equals the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NominationDiff {
    /// New matches; inserted with `updated = true`.
    pub insert: Vec<NominationKey>,
    /// Stored rows that no longer match.
    pub delete: Vec<NominationKey>,
}

/// Every (input, data) pair the predicate accepts.
pub fn desired(inputs: &[InputCriteria], candidates: &[DataCandidate]) -> BTreeSet<NominationKey> {
    inputs
        .iter()
        .flat_map(|input| {
            candidates
                .iter()
                .filter(move |candidate| matches(input, candidate))
                .map(move |candidate| NominationKey::new(input.input_id, candidate.knit_id.clone()))
        })
        .collect()
}

/// Compares `desired` with `existing`. Rows in both are left out of the diff,
/// so their `updated` flag survives.
pub fn reconcile(desired: &BTreeSet<NominationKey>, existing: &[Nomination]) -> NominationDiff {
    let stored: BTreeSet<NominationKey> = existing.iter().map(Nomination::key).collect();

    NominationDiff {
        insert: desired.difference(&stored).cloned().collect(),
        delete: stored.difference(desired).cloned().collect(),
    }
}
