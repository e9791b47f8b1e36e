use serde::{Deserialize, Serialize};

use super::data::KnitId;
use super::plan::InputId;

/// Identity of a nomination row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NominationKey {
    pub input_id: InputId,
    pub knit_id: KnitId,
}

impl NominationKey {
    pub fn new(input_id: InputId, knit_id: KnitId) -> Self {
        Self { input_id, knit_id }
    }
}

/// A data item currently satisfying an input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nomination {
    pub input_id: InputId,
    pub knit_id: KnitId,
    /// Set on discovery; cleared by the assigner once consumed.
    pub updated: bool,
}

impl Nomination {
    pub fn key(&self) -> NominationKey {
        NominationKey::new(self.input_id, self.knit_id.clone())
    }
}
