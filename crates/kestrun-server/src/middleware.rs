//! Script execution middleware
//!
//! Drives one request through its pipeline stages. For each stage the
//! middleware acquires a runspace if the stage's delegate needs one, hands
//! it to the delegate together with the downstream continuation, and relies
//! on the lease's `Drop` to put it back on every exit path.
//!
//! A stage that wants the rest of the pipeline awaits [`Next::run`]; a stage
//! that never calls it short-circuits everything after it.

use futures_util::future::BoxFuture;
use kestrun_common::{KestrunError, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::KestrunContext;
use crate::languages::Delegate;
use crate::runtime::{RunspaceLease, RunspacePool};

#[derive(Clone)]
pub struct ScriptExecutionMiddleware {
    pool: RunspacePool,
}

impl ScriptExecutionMiddleware {
    pub fn new(pool: RunspacePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RunspacePool {
        &self.pool
    }

    /// Runs `stages` in order, starting with the first.
    pub async fn run(&self, ctx: &mut KestrunContext, stages: Arc<[Arc<dyn Delegate>]>) -> Result<()> {
        Next::new(self.clone(), stages).run(ctx).await
    }

    /// Runs a single delegate with `next` as its continuation.
    pub fn execute<'a>(
        &'a self,
        ctx: &'a mut KestrunContext,
        delegate: Arc<dyn Delegate>,
        next: Next,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let language = delegate.language();
            let lease = if delegate.requires_runspace() {
                Some(self.acquire(&ctx.cancellation).await?)
            } else {
                None
            };
            let runspace = lease.as_ref().map(RunspaceLease::id);

            tracing::debug!(%language, ?runspace, stage = next.index.saturating_sub(1), "Invoking delegate");
            let started = Instant::now();
            let result = delegate.invoke(ctx, lease, next).await;
            let elapsed_ms = started.elapsed().as_millis();

            match &result {
                Ok(()) => tracing::debug!(%language, ?runspace, elapsed_ms, "Delegate completed"),
                Err(e) => tracing::warn!(%language, ?runspace, elapsed_ms, "Delegate failed: {}", e),
            }
            result
        })
    }

    async fn acquire(&self, cancellation: &CancellationToken) -> Result<RunspaceLease> {
        tokio::select! {
            lease = self.pool.acquire() => lease,
            _ = cancellation.cancelled() => Err(KestrunError::Cancelled),
        }
    }
}

/// The rest of the pipeline after the current stage.
pub struct Next {
    middleware: ScriptExecutionMiddleware,
    stages: Arc<[Arc<dyn Delegate>]>,
    index: usize,
}

impl Next {
    fn new(middleware: ScriptExecutionMiddleware, stages: Arc<[Arc<dyn Delegate>]>) -> Self {
        Self {
            middleware,
            stages,
            index: 0,
        }
    }

    /// A continuation with nothing after it.
    pub fn terminal(middleware: ScriptExecutionMiddleware) -> Self {
        Self::new(middleware, Arc::from(Vec::new()))
    }

    pub fn is_terminal(&self) -> bool {
        self.index >= self.stages.len()
    }

    /// Runs the remaining stages. Completes immediately when there are none.
    pub fn run(self, ctx: &mut KestrunContext) -> BoxFuture<'_, Result<()>> {
        let Some(stage) = self.stages.get(self.index).cloned() else {
            return Box::pin(async { Ok(()) });
        };

        let next = Next {
            middleware: self.middleware.clone(),
            stages: Arc::clone(&self.stages),
            index: self.index + 1,
        };
        Box::pin(async move { self.middleware.execute(ctx, stage, next).await })
    }
}
