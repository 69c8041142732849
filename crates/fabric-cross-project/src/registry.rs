//! # Project & Contract Registries
//!
//! Concurrent registries for tenant policy and event contracts. Lookups
//! default to deny: an unregistered project cannot send or receive, and a
//! triple with no covering contract is undeliverable regardless of
//! project-level allow-lists.

use crate::error::CrossProjectError;
use dashmap::DashMap;
use fabric_types::{CrossProjectEventContract, ProjectConfig};
use tracing::debug;

/// Registered projects by id.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    projects: DashMap<String, ProjectConfig>,
}

impl ProjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a project's policy record.
    ///
    /// Identity fields must be present; re-registration replaces policy
    /// wholesale (no partial merges).
    ///
    /// # Errors
    ///
    /// Returns `CrossProjectError::InvalidProjectConfig` for empty
    /// `project_id` or `namespace`.
    pub fn register(&self, config: ProjectConfig) -> Result<(), CrossProjectError> {
        if config.project_id.is_empty() {
            return Err(CrossProjectError::InvalidProjectConfig {
                reason: "project_id is empty".to_string(),
            });
        }
        if config.namespace.is_empty() {
            return Err(CrossProjectError::InvalidProjectConfig {
                reason: "namespace is empty".to_string(),
            });
        }

        debug!(project = %config.project_id, namespace = %config.namespace, "Project registered");
        self.projects.insert(config.project_id.clone(), config);
        Ok(())
    }

    /// Fetch a project's policy.
    #[must_use]
    pub fn get(&self, project_id: &str) -> Option<ProjectConfig> {
        self.projects.get(project_id).map(|p| p.clone())
    }

    /// True when the project is registered.
    #[must_use]
    pub fn exists(&self, project_id: &str) -> bool {
        self.projects.contains_key(project_id)
    }

    /// Number of registered projects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// True when no projects are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

/// Registered contracts, keyed by `name@version`.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: DashMap<String, CrossProjectEventContract>,
}

impl ContractRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a contract.
    ///
    /// # Errors
    ///
    /// Returns `CrossProjectError::InvalidContract` when a required field
    /// is missing.
    pub fn register(&self, contract: CrossProjectEventContract) -> Result<(), CrossProjectError> {
        let missing = |field: &str| CrossProjectError::InvalidContract {
            reason: format!("{field} is required"),
        };

        if contract.name.is_empty() {
            return Err(missing("name"));
        }
        if contract.version.is_empty() {
            return Err(missing("version"));
        }
        if contract.source_project.is_empty() {
            return Err(missing("source_project"));
        }
        if contract.target_projects.is_empty() {
            return Err(missing("target_projects"));
        }
        if contract.event_types.is_empty() {
            return Err(missing("event_types"));
        }

        let key = format!("{}@{}", contract.name, contract.version);
        debug!(contract = %key, source = %contract.source_project, "Contract registered");
        self.contracts.insert(key, contract);
        Ok(())
    }

    /// True when some contract covers the triple.
    #[must_use]
    pub fn covers(&self, source: &str, target: &str, event_type: &str) -> bool {
        self.contracts
            .iter()
            .any(|c| c.covers(source, target, event_type))
    }

    /// Contracts where the given project is the source.
    #[must_use]
    pub fn for_source(&self, source: &str) -> Vec<CrossProjectEventContract> {
        self.contracts
            .iter()
            .filter(|c| c.source_project == source)
            .map(|c| c.clone())
            .collect()
    }

    /// Number of registered contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// True when no contracts are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
