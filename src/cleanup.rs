//! Deferred cleanup scheduling
//!
//! The scope of a cleanup is fixed when it is registered, from the role of
//! the node that is running at that moment:
//!
//! | registered in | runs like | scope |
//! |---|---|---|
//! | It, BeforeEach, JustBeforeEach, AfterEach, JustAfterEach | AfterEach | the spec |
//! | BeforeAll, AfterAll | AfterAll | the enclosing Ordered container |
//! | any suite-level node | AfterSuite | the whole run |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::dsl::SpecContext;
use crate::error::DeclarationError;
use crate::models::{CodeLocation, NodeRole, SpecFn};

/// Where a deferred cleanup is collected until its scope closes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupScope {
    Spec,
    OrderedContainer,
    Suite,
}

impl CleanupScope {
    /// The hook a cleanup in this scope behaves like
    pub fn runs_like(&self) -> NodeRole {
        match self {
            CleanupScope::Spec => NodeRole::AfterEach,
            CleanupScope::OrderedContainer => NodeRole::AfterAll,
            CleanupScope::Suite => NodeRole::AfterSuite,
        }
    }
}

impl fmt::Display for CleanupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferCleanup ({})", self.runs_like())
    }
}

/// Resolve the scope for a cleanup registered while `role` is running
pub fn resolve_scope(
    role: Option<NodeRole>,
    location: &CodeLocation,
) -> Result<CleanupScope, DeclarationError> {
    match role {
        Some(NodeRole::It) => Ok(CleanupScope::Spec),
        Some(role) if role.is_each_hook() => Ok(CleanupScope::Spec),
        Some(role) if role.is_all_hook() => Ok(CleanupScope::OrderedContainer),
        Some(role) if role.is_suite_level() => Ok(CleanupScope::Suite),
        Some(NodeRole::Cleanup) => Err(DeclarationError::CleanupInCleanup {
            location: location.clone(),
        }),
        _ => Err(DeclarationError::CleanupOutsideNode {
            location: location.clone(),
        }),
    }
}

/// Return convention for cleanup callbacks.
///
/// `()` always succeeds; `Result::Err` fails the scope that owns the cleanup.
pub trait CleanupOutcome {
    fn into_cleanup_result(self) -> Result<(), String>;
}

impl CleanupOutcome for () {
    fn into_cleanup_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> CleanupOutcome for Result<(), E> {
    fn into_cleanup_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// A cleanup waiting for its scope to close
#[derive(Clone)]
pub struct CleanupRegistration {
    pub scope: CleanupScope,
    pub location: CodeLocation,
    pub(crate) body: SpecFn,
}

impl CleanupRegistration {
    /// Wrap a one-shot callback; it runs at most once however often the body is invoked
    pub fn new<F, R>(scope: CleanupScope, location: CodeLocation, callback: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: CleanupOutcome,
    {
        let slot = Mutex::new(Some(callback));
        let failure_location = location.clone();
        let body: SpecFn = Arc::new(move |ctx: &SpecContext| {
            let callback = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(callback) = callback {
                if let Err(message) = callback().into_cleanup_result() {
                    ctx.fail_at(
                        format!("DeferCleanup callback returned error: {message}"),
                        failure_location.clone(),
                    );
                }
            }
        });
        Self {
            scope,
            location,
            body,
        }
    }
}

impl fmt::Debug for CleanupRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupRegistration")
            .field("scope", &self.scope)
            .field("location", &self.location)
            .finish()
    }
}

/// Pending cleanups for every open scope
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    queues: Mutex<HashMap<CleanupScope, Vec<CleanupRegistration>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: CleanupRegistration) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(registration.scope)
            .or_default()
            .push(registration);
    }

    /// Close a scope: its cleanups, last registered first
    pub fn drain(&self, scope: CleanupScope) -> Vec<CleanupRegistration> {
        let mut drained = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&scope)
            .unwrap_or_default();
        drained.reverse();
        drained
    }

    pub fn pending(&self, scope: CleanupScope) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&scope)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> CodeLocation {
        CodeLocation::new("cleanup_test.rs", 1)
    }

    #[test]
    fn test_scope_resolution() {
        for role in [
            NodeRole::It,
            NodeRole::BeforeEach,
            NodeRole::JustBeforeEach,
            NodeRole::AfterEach,
            NodeRole::JustAfterEach,
        ] {
            assert_eq!(resolve_scope(Some(role), &loc()), Ok(CleanupScope::Spec));
        }
        assert_eq!(
            resolve_scope(Some(NodeRole::BeforeAll), &loc()),
            Ok(CleanupScope::OrderedContainer)
        );
        assert_eq!(
            resolve_scope(Some(NodeRole::AfterAll), &loc()),
            Ok(CleanupScope::OrderedContainer)
        );
        for role in [
            NodeRole::BeforeSuite,
            NodeRole::AfterSuite,
            NodeRole::SynchronizedBeforeSuite,
            NodeRole::SynchronizedAfterSuite,
        ] {
            assert_eq!(resolve_scope(Some(role), &loc()), Ok(CleanupScope::Suite));
        }
    }

    #[test]
    fn test_scope_resolution_rejects_containers_and_cleanups() {
        assert!(matches!(
            resolve_scope(Some(NodeRole::Container), &loc()),
            Err(DeclarationError::CleanupOutsideNode { .. })
        ));
        assert!(matches!(
            resolve_scope(None, &loc()),
            Err(DeclarationError::CleanupOutsideNode { .. })
        ));
        assert!(matches!(
            resolve_scope(Some(NodeRole::Cleanup), &loc()),
            Err(DeclarationError::CleanupInCleanup { .. })
        ));
    }

    #[test]
    fn test_drain_is_lifo_per_scope() {
        let registry = CleanupRegistry::new();
        for line in 1..=3 {
            registry.register(CleanupRegistration::new(
                CleanupScope::Spec,
                CodeLocation::new("a.rs", line),
                || {},
            ));
        }
        registry.register(CleanupRegistration::new(CleanupScope::Suite, loc(), || {}));

        let lines: Vec<u32> = registry
            .drain(CleanupScope::Spec)
            .iter()
            .map(|r| r.location.line)
            .collect();
        assert_eq!(lines, vec![3, 2, 1]);
        assert_eq!(registry.pending(CleanupScope::Spec), 0);
        assert_eq!(registry.pending(CleanupScope::Suite), 1);
    }

    #[test]
    fn test_cleanup_outcome_conventions() {
        assert_eq!(().into_cleanup_result(), Ok(()));
        let failed: Result<(), String> = Err("disk full".into());
        assert_eq!(failed.into_cleanup_result(), Err("disk full".to_string()));
    }
}
