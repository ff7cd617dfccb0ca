use futures_util::future::BoxFuture;
use kestrun_common::{KestrunError, Result};
use tokio_util::sync::CancellationToken;

use crate::context::KestrunContext;
use crate::languages::{Delegate, ScriptLanguage};
use crate::middleware::Next;
use crate::resource_limits::ResourceLimits;
use crate::runtime::{JsProgram, RunspaceLease, ScriptInput, ScriptOutput};

/// JavaScript handler interpreted inside a leased runspace.
///
/// The script sees `Request`, `Response` and `Context`. Whatever it writes
/// to `Response` is applied to the request's response once it finishes;
/// messages passed to `writeError` fail the request.
pub struct JavaScriptDelegate {
    program: JsProgram,
    limits: ResourceLimits,
}

impl JavaScriptDelegate {
    /// # Errors
    ///
    /// `ScriptCompilation` if the snippet is not valid JavaScript.
    pub fn compile(code: &str, limits: ResourceLimits) -> Result<Self> {
        Ok(Self {
            program: JsProgram::compile(code)?,
            limits,
        })
    }

    async fn run(
        &self,
        input: ScriptInput,
        cancellation: CancellationToken,
        mut lease: RunspaceLease,
    ) -> Result<ScriptOutput> {
        let program = self.program.clone();
        let timeout = self.limits.execution_timeout;

        let outcome = {
            let execution = lease.run(move |runspace| runspace.execute(&program, input));
            tokio::select! {
                result = tokio::time::timeout(timeout, execution) => Some(result),
                _ = cancellation.cancelled() => None,
            }
        };

        // An unfinished run leaves the lease in flight, so dropping it
        // discards the runspace instead of returning it.
        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                lease.mark_broken();
                tracing::warn!(runspace = lease.id(), "JavaScript handler timed out");
                Err(KestrunError::ExecutionTimeout(self.limits.execution_timeout_ms()))
            }
            None => {
                lease.mark_broken();
                Err(KestrunError::Cancelled)
            }
        }
    }
}

impl Delegate for JavaScriptDelegate {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::JavaScript
    }

    fn requires_runspace(&self) -> bool {
        true
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a mut KestrunContext,
        runspace: Option<RunspaceLease>,
        next: Next,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let lease = runspace.ok_or_else(|| {
                KestrunError::RunspaceCreation("JavaScript handler invoked without a runspace".into())
            })?;

            let input = ScriptInput {
                request: ctx.request.to_script_value(),
                response: ctx.response.to_script_state(),
                context: ctx.to_script_value(),
            };
            // The lease is consumed here so the runspace is back in the pool
            // before any downstream stage runs.
            let output = self.run(input, ctx.cancellation.clone(), lease).await?;

            ctx.response.apply_script_state(output.response);
            ctx.items = output.items;

            if !output.errors.is_empty() {
                return Err(KestrunError::ScriptRuntime(output.errors.join("; ")));
            }
            if output.call_next {
                next.run(ctx).await?;
            }
            Ok(())
        })
    }
}
