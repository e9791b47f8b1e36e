use crate::domain::{KnitId, RunId};
use crate::error::NamingError;

/// Default prefix of volume references.
pub const DEFAULT_VOLUME_PREFIX: &str = "data-knitid-";

/// Default prefix of worker names.
pub const DEFAULT_WORKER_PREFIX: &str = "worker-run-";

/// Longest name a cluster object may carry.
pub const MAX_NAME_LEN: usize = 63;

/// Derives storage and workload handles from core identities.
pub trait NamingConvention: Send + Sync {
    /// Name of the volume that holds a data item.
    fn volume_ref(&self, knit_id: &KnitId) -> Result<String, NamingError>;

    /// Name of the workload executing a run.
    fn worker(&self, run_id: &RunId) -> Result<String, NamingError>;
}

/// Names built as `prefix + id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixNamingConvention {
    volume_prefix: String,
    worker_prefix: String,
}

impl Default for PrefixNamingConvention {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_PREFIX, DEFAULT_WORKER_PREFIX)
    }
}

impl PrefixNamingConvention {
    pub fn new(volume_prefix: impl Into<String>, worker_prefix: impl Into<String>) -> Self {
        Self {
            volume_prefix: volume_prefix.into(),
            worker_prefix: worker_prefix.into(),
        }
    }

    fn build(prefix: &str, id: &str) -> Result<String, NamingError> {
        let name = format!("{}{}", prefix, id);
        if let Err(reason) = check_dns_label(&name) {
            return Err(NamingError::Rejected {
                subject: id.to_string(),
                reason,
            });
        }
        Ok(name)
    }
}

impl NamingConvention for PrefixNamingConvention {
    fn volume_ref(&self, knit_id: &KnitId) -> Result<String, NamingError> {
        Self::build(&self.volume_prefix, knit_id.as_str())
    }

    fn worker(&self, run_id: &RunId) -> Result<String, NamingError> {
        Self::build(&self.worker_prefix, run_id.as_str())
    }
}

/// Checks RFC 1123 label syntax: lowercase alphanumerics and `-`, starting
/// and ending alphanumeric, at most [`MAX_NAME_LEN`] characters.
pub fn check_dns_label(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "'{}' is {} characters, limit is {}",
            name,
            name.len(),
            MAX_NAME_LEN
        ));
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if let Some(bad) = name.chars().find(|c| !allowed(*c) && *c != '-') {
        return Err(format!("'{}' contains '{}'", name, bad));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("'{}' must start and end alphanumeric", name));
    }
    Ok(())
}
