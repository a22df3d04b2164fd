//! Reversible action pipelines.
//!
//! This library provides the execution primitive used by deploys, scale
//! operations and healing: an ordered list of actions where every action
//! knows how to undo itself. Key concepts:
//!
//! - **Forward**: the effectful step of an action. Runs strictly in
//!   declaration order; results are threaded through the shared context.
//! - **Backward**: the compensating step. Must be idempotent.
//! - **Rollback**: on any forward error, the backward of every previously
//!   completed action runs in reverse order, then the failing action's
//!   error hook, then the original error is returned.
//!
//! # Invariants
//!
//! - Forwards within one pipeline are strictly sequential.
//! - Rollback runs on explicit error returns, never on unwinding.
//! - A backward failure never masks the forward error that triggered it.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

/// Error type produced by action forwards.
///
/// Actions surface their own domain errors; the pipeline only needs to
/// carry them, so they are boxed at this seam.
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A forward step failed. Rollback has already run; any backward
    /// failures are recorded alongside the primary error.
    #[error("{source}")]
    Failed {
        /// Name of the action whose forward failed.
        action: String,
        #[source]
        source: ActionError,
        /// Names of actions whose backward also failed during rollback.
        rollback_failures: Vec<String>,
    },
}

impl PipelineError {
    /// Name of the action that caused the failure.
    pub fn action(&self) -> &str {
        match self {
            Self::Failed { action, .. } => action,
        }
    }

    /// Whether any backward step failed while rolling back.
    pub fn rollback_degraded(&self) -> bool {
        match self {
            Self::Failed {
                rollback_failures, ..
            } => !rollback_failures.is_empty(),
        }
    }

    /// The original forward error.
    pub fn into_source(self) -> ActionError {
        match self {
            Self::Failed { source, .. } => source,
        }
    }
}

/// A single reversible step.
///
/// `C` is the context shared by all actions of one pipeline run. Forward
/// results are written into the context for downstream actions to read.
#[async_trait]
pub trait Action<C: Send>: Send + Sync {
    /// Action name for logs.
    fn name(&self) -> &str;

    /// Perform the step. Partial progress must be recorded in the context
    /// so that `backward` can compensate precisely.
    async fn forward(&self, ctx: &mut C) -> Result<(), ActionError>;

    /// Undo the step. Called only after this action's forward succeeded.
    /// Must be idempotent; errors are reported but do not stop rollback.
    async fn backward(&self, ctx: &mut C) -> Result<(), ActionError>;

    /// Hook invoked on the action whose own forward failed, after the
    /// rollback of earlier actions has completed.
    async fn on_error(&self, _ctx: &mut C, _err: &ActionError) {}
}

/// An ordered set of actions executed with rollback-on-failure semantics.
pub struct Pipeline<C: Send> {
    actions: Vec<Box<dyn Action<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(actions: Vec<Box<dyn Action<C>>>) -> Self {
        Self { actions }
    }

    /// Execute all actions forward, in order.
    ///
    /// On the first forward error: run the backward of every completed
    /// action in reverse order, invoke the failing action's `on_error`,
    /// and return the original error.
    pub async fn execute(&self, ctx: &mut C) -> Result<(), PipelineError> {
        for (idx, action) in self.actions.iter().enumerate() {
            debug!(action = action.name(), "pipeline forward");
            if let Err(err) = action.forward(ctx).await {
                error!(
                    action = action.name(),
                    error = %err,
                    "pipeline forward failed, rolling back"
                );
                let rollback_failures = self.rollback(ctx, idx).await;
                action.on_error(ctx, &err).await;
                return Err(PipelineError::Failed {
                    action: action.name().to_string(),
                    source: err,
                    rollback_failures,
                });
            }
        }
        Ok(())
    }

    /// Run backwards for actions `0..failed_idx` in reverse order.
    /// Returns the names of actions whose backward failed.
    async fn rollback(&self, ctx: &mut C, failed_idx: usize) -> Vec<String> {
        let mut failures = Vec::new();
        for action in self.actions[..failed_idx].iter().rev() {
            debug!(action = action.name(), "pipeline backward");
            if let Err(err) = action.backward(ctx).await {
                error!(
                    action = action.name(),
                    error = %err,
                    "pipeline backward failed"
                );
                failures.push(action.name().to_string());
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Ctx {
        log: Vec<String>,
    }

    struct Step {
        name: String,
        fail_forward: bool,
        fail_backward: bool,
        error_hooks: Arc<AtomicUsize>,
    }

    impl Step {
        fn ok(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_forward: false,
                fail_backward: false,
                error_hooks: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                fail_forward: true,
                ..Self::ok(name)
            }
        }
    }

    #[async_trait]
    impl Action<Ctx> for Step {
        fn name(&self) -> &str {
            &self.name
        }

        async fn forward(&self, ctx: &mut Ctx) -> Result<(), ActionError> {
            if self.fail_forward {
                return Err(format!("{} blew up", self.name).into());
            }
            ctx.log.push(format!("+{}", self.name));
            Ok(())
        }

        async fn backward(&self, ctx: &mut Ctx) -> Result<(), ActionError> {
            if self.fail_backward {
                return Err(format!("{} rollback blew up", self.name).into());
            }
            ctx.log.push(format!("-{}", self.name));
            Ok(())
        }

        async fn on_error(&self, _ctx: &mut Ctx, _err: &ActionError) {
            self.error_hooks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_all_forwards_run_in_order() {
        let pipeline = Pipeline::new(vec![
            Box::new(Step::ok("a")) as Box<dyn Action<Ctx>>,
            Box::new(Step::ok("b")),
            Box::new(Step::ok("c")),
        ]);
        let mut ctx = Ctx::default();
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.log, vec!["+a", "+b", "+c"]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_completed_actions_in_reverse() {
        let failing = Step::failing("c");
        let hooks = failing.error_hooks.clone();
        let pipeline = Pipeline::new(vec![
            Box::new(Step::ok("a")) as Box<dyn Action<Ctx>>,
            Box::new(Step::ok("b")),
            Box::new(failing),
            Box::new(Step::ok("d")),
        ]);
        let mut ctx = Ctx::default();
        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.action(), "c");
        assert_eq!(err.to_string(), "c blew up");
        assert_eq!(ctx.log, vec!["+a", "+b", "-b", "-a"]);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backward_failure_does_not_mask_primary_error() {
        let bad_rollback = Step {
            fail_backward: true,
            ..Step::ok("a")
        };
        let pipeline = Pipeline::new(vec![
            Box::new(bad_rollback) as Box<dyn Action<Ctx>>,
            Box::new(Step::ok("b")),
            Box::new(Step::failing("c")),
        ]);
        let mut ctx = Ctx::default();
        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "c blew up");
        assert!(err.rollback_degraded());
        // b still rolled back even though a's backward failed.
        assert_eq!(ctx.log, vec!["+a", "+b", "-b"]);
    }

    #[tokio::test]
    async fn test_first_action_failure_rolls_back_nothing() {
        let pipeline = Pipeline::new(vec![
            Box::new(Step::failing("a")) as Box<dyn Action<Ctx>>,
            Box::new(Step::ok("b")),
        ]);
        let mut ctx = Ctx::default();
        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.action(), "a");
        assert!(!err.rollback_degraded());
        assert!(ctx.log.is_empty());
    }
}
