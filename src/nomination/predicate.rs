use crate::domain::{DataCandidate, InputCriteria, RunStatus};

/// Whether `candidate` currently satisfies `criteria`.
///
/// Data whose producing run is not exactly `Done` never matches, and an input
/// declaring no criteria at all matches nothing. Otherwise every declared
/// criterion must hold: all criterion tags are present, the timestamp is one
/// of the listed instants, the knit id is one of the listed ids.
///
/// Candidate tags are user tags only. Criterion tags with a reserved key are
/// refused when a plan is registered (see `Plan::check_criteria`), so they
/// never reach this point.
pub(crate) fn matches(criteria: &InputCriteria, candidate: &DataCandidate) -> bool {
    if candidate.run_status != RunStatus::Done {
        return false;
    }
    if criteria.is_unconstrained() {
        return false;
    }

    if !criteria.tags.is_subset_of(&candidate.tags) {
        return false;
    }

    if !criteria.timestamps.is_empty() {
        let Some(at) = candidate.timestamp else {
            return false;
        };
        if !criteria.timestamps.contains(&at) {
            return false;
        }
    }

    if !criteria.knit_ids.is_empty() && !criteria.knit_ids.contains(&candidate.knit_id) {
        return false;
    }

    true
}
