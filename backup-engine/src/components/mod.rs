//! Component serializers.
//!
//! Each component knows how to capture itself into an [`ArchiveSession`]
//! and restore itself from one. Add-ons and folders are handled strictly
//! one after another to bound disk I/O; a failing item is logged and
//! skipped.
//!
//! [`ArchiveSession`]: crate::archive::ArchiveSession

pub mod addons;
pub mod folders;
pub mod homeassistant;
pub mod registries;
pub mod repositories;

/// Outcome of a best-effort loop over components
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl Outcome {
    pub(crate) fn record<T, E: std::fmt::Display>(&mut self, kind: &str, name: &str, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => {
                self.succeeded.push(name.to_string());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(component = kind, name, error = %e, "Component failed, skipping");
                self.failed.push(name.to_string());
                None
            }
        }
    }
}
