//! The vocabulary of reversible edits and their composition
//!
//! Every mutation the engine performs is an [`Action`]: a paired
//! apply/undo with an `is_done` predicate that marks the applied state and
//! one-line explanations for the log. Actions never talk to the API server;
//! they are pure edits over an in-memory object. The two plan types
//! ([`service::ServiceActions`] and [`workload::WorkloadActions`]) compose
//! their actions through [`MultiAction`] and are what gets serialized into
//! the cluster annotation.
//!
//! Composition rules:
//! - apply runs forward and skips any child whose `is_done` already holds,
//!   which is what makes a plan safe to re-run;
//! - undo runs in exact reverse order and fails fast;
//! - neither rolls back its own sub-steps on failure. The recorded plan is
//!   the rollback mechanism, invoked later by the driver.

pub mod service;
pub mod workload;

use tracing::warn;

use crate::Result;

/// A reversible edit over a single Kubernetes object.
pub trait Action {
    /// The object type this action edits.
    type Target;

    /// Perform the edit. Fails when the object does not satisfy the
    /// action's preconditions.
    fn apply(&self, target: &mut Self::Target) -> Result<()>;

    /// Exactly invert [`Action::apply`]. Fails when the post-apply marker
    /// is absent from the object.
    fn undo(&self, target: &mut Self::Target) -> Result<()>;

    /// Side-effect-free check for the action's post-apply marker.
    fn is_done(&self, target: &Self::Target) -> bool;

    /// One-line description of what apply will do, for the log.
    fn explain_apply(&self, target: &Self::Target) -> String;

    /// One-line description of what undo will do, for the log.
    fn explain_undo(&self, target: &Self::Target) -> String;
}

/// An ordered collection of actions persisted as one plan.
pub trait MultiAction: Action {
    /// The child actions, in apply order.
    fn actions(&self) -> Vec<&dyn Action<Target = Self::Target>>;

    /// Discriminator between the plan flavors, used in explain strings.
    fn object_type(&self) -> &'static str;

    /// The engine version that produced this plan.
    fn plan_version(&self) -> &str;
}

/// Which direction an explanation describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Explain {
    /// Describe the forward edits.
    Apply,
    /// Describe the inverse edits.
    Undo,
}

/// Apply all child actions in order.
///
/// A child whose `is_done` marker already holds is skipped, so applying a
/// plan twice is identical to applying it once. Fails fast on the first
/// error without undoing earlier children.
pub fn apply_actions<T>(ma: &dyn MultiAction<Target = T>, target: &mut T) -> Result<()> {
    for action in ma.actions() {
        if action.is_done(target) {
            continue;
        }
        action.apply(target)?;
    }
    Ok(())
}

/// Undo all child actions in reverse order, failing fast.
pub fn undo_actions<T>(ma: &dyn MultiAction<Target = T>, target: &mut T) -> Result<()> {
    for action in ma.actions().into_iter().rev() {
        action.undo(target)?;
    }
    Ok(())
}

/// Whether every child action reports its applied state.
pub fn actions_done<T>(ma: &dyn MultiAction<Target = T>, target: &T) -> bool {
    ma.actions().iter().all(|a| a.is_done(target))
}

/// Best-effort inverse of a partially applied plan.
///
/// Walks the children in reverse and undoes each one whose marker is
/// present, logging and continuing past individual failures. Returns true
/// when no child marker remains, i.e. the object is fully restored.
pub fn rollback_actions<T>(ma: &dyn MultiAction<Target = T>, target: &mut T) -> bool {
    let mut restored = true;
    for action in ma.actions().into_iter().rev() {
        if !action.is_done(target) {
            continue;
        }
        if let Err(error) = action.undo(target) {
            warn!(%error, "rollback step failed, continuing");
        }
        if action.is_done(target) {
            restored = false;
        }
    }
    restored
}

/// Build the one-sentence explanation for a plan.
///
/// `object` is the "kind name" phrase, e.g. `deployment hello`. Returns an
/// empty string for a plan with no actions so callers can skip the log line.
pub fn explain_actions<T>(
    ma: &dyn MultiAction<Target = T>,
    target: &T,
    object: &str,
    direction: Explain,
) -> String {
    let phrases: Vec<String> = ma
        .actions()
        .iter()
        .map(|a| match direction {
            Explain::Apply => a.explain_apply(target),
            Explain::Undo => a.explain_undo(target),
        })
        .collect();
    let joined = match phrases.as_slice() {
        [] => return String::new(),
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    };
    format!("In {object}, {joined}.")
}
