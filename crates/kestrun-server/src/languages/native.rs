use futures_util::future::BoxFuture;
use kestrun_common::Result;

use crate::context::KestrunContext;
use crate::languages::{Delegate, ScriptLanguage};
use crate::middleware::Next;
use crate::runtime::RunspaceLease;

type Handler = dyn for<'a> Fn(&'a mut KestrunContext, Next) -> BoxFuture<'a, Result<()>> + Send + Sync;

/// A precompiled Rust handler. No interpretation and no runspace.
///
/// # Example
///
/// ```
/// use kestrun_server::languages::NativeDelegate;
///
/// let hello = NativeDelegate::new(|ctx, _next| {
///     Box::pin(async move {
///         ctx.response.write_text("hello", None);
///         Ok(())
///     })
/// });
/// ```
pub struct NativeDelegate {
    handler: Box<Handler>,
}

impl NativeDelegate {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut KestrunContext, Next) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Self { handler: Box::new(f) }
    }
}

impl Delegate for NativeDelegate {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Native
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a mut KestrunContext,
        _runspace: Option<RunspaceLease>,
        next: Next,
    ) -> BoxFuture<'a, Result<()>> {
        (self.handler)(ctx, next)
    }
}
