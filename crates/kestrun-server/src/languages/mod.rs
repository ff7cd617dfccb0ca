//! Language delegate builders
//!
//! A route handler arrives as a [`HandlerSource`]: source text plus a
//! language tag, or a native Rust closure. [`build_delegate`] resolves it
//! once, at registration, into an `Arc<dyn Delegate>` so no language
//! branching happens on the request path and compile errors surface before
//! the first request.
//!
//! | Variant       | Language   | Needs a runspace | Compiled          |
//! |---------------|------------|------------------|-------------------|
//! | `Interpreted` | JavaScript | yes              | syntax check only |
//! | `Compiled`    | Rhai       | no               | AST + modules     |
//! | `Native`      | Rust       | no               | ahead of time     |

pub mod javascript;
pub mod native;
pub mod rhai;

use futures_util::future::BoxFuture;
use kestrun_common::{KestrunError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::context::KestrunContext;
use crate::middleware::Next;
use crate::resource_limits::ResourceLimits;
use crate::runtime::RunspaceLease;
use crate::shared_state::SharedStateStore;

pub use javascript::JavaScriptDelegate;
pub use native::NativeDelegate;
pub use self::rhai::RhaiDelegate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptLanguage {
    #[serde(alias = "javascript", alias = "js")]
    JavaScript,
    #[serde(alias = "rhai")]
    Rhai,
    #[serde(alias = "native")]
    Native,
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptLanguage::JavaScript => write!(f, "JavaScript"),
            ScriptLanguage::Rhai => write!(f, "Rhai"),
            ScriptLanguage::Native => write!(f, "Native"),
        }
    }
}

impl FromStr for ScriptLanguage {
    type Err = KestrunError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(ScriptLanguage::JavaScript),
            "rhai" => Ok(ScriptLanguage::Rhai),
            "native" => Ok(ScriptLanguage::Native),
            other => Err(KestrunError::Config(format!("Unknown script language '{}'", other))),
        }
    }
}

/// Extra compile inputs for compiled languages.
///
/// `references` are named modules of source, callable as `name::func()`.
/// `imports` lists module names whose functions are also made callable
/// unqualified; they may name a reference or a built-in module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_import(mut self, module: impl Into<String>) -> Self {
        self.imports.push(module.into());
        self
    }

    pub fn with_reference(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.references.insert(name.into(), source.into());
        self
    }
}

/// A handler as supplied at route registration.
#[derive(Clone)]
pub enum HandlerSource {
    Interpreted {
        language: ScriptLanguage,
        code: String,
    },
    Compiled {
        language: ScriptLanguage,
        code: String,
        options: CompileOptions,
    },
    Native(Arc<dyn Delegate>),
}

impl HandlerSource {
    pub fn javascript(code: impl Into<String>) -> Self {
        HandlerSource::Interpreted {
            language: ScriptLanguage::JavaScript,
            code: code.into(),
        }
    }

    pub fn rhai(code: impl Into<String>) -> Self {
        Self::rhai_with(code, CompileOptions::default())
    }

    pub fn rhai_with(code: impl Into<String>, options: CompileOptions) -> Self {
        HandlerSource::Compiled {
            language: ScriptLanguage::Rhai,
            code: code.into(),
            options,
        }
    }

    /// Wraps a native async handler.
    pub fn native<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut KestrunContext, Next) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        HandlerSource::Native(Arc::new(NativeDelegate::new(f)))
    }

    /// Picks the variant that suits `language`. Native handlers cannot be
    /// described by source text.
    pub fn from_source(language: ScriptLanguage, code: impl Into<String>, options: CompileOptions) -> Result<Self> {
        match language {
            ScriptLanguage::JavaScript => Ok(HandlerSource::Interpreted {
                language,
                code: code.into(),
            }),
            ScriptLanguage::Rhai => Ok(HandlerSource::Compiled {
                language,
                code: code.into(),
                options,
            }),
            ScriptLanguage::Native => Err(KestrunError::Config(
                "Native handlers must be registered from Rust code".into(),
            )),
        }
    }

    pub fn language(&self) -> ScriptLanguage {
        match self {
            HandlerSource::Interpreted { language, .. } | HandlerSource::Compiled { language, .. } => *language,
            HandlerSource::Native(delegate) => delegate.language(),
        }
    }
}

impl fmt::Debug for HandlerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerSource::Interpreted { language, code } => f
                .debug_struct("Interpreted")
                .field("language", language)
                .field("code_len", &code.len())
                .finish(),
            HandlerSource::Compiled { language, code, options } => f
                .debug_struct("Compiled")
                .field("language", language)
                .field("code_len", &code.len())
                .field("imports", &options.imports)
                .finish(),
            HandlerSource::Native(_) => write!(f, "Native"),
        }
    }
}

/// A resolved, invocable handler.
///
/// `invoke` receives the runspace lease when [`requires_runspace`] is true
/// and owns it: the lease is returned to the pool when the delegate drops
/// it, which must happen before awaiting `next`.
///
/// [`requires_runspace`]: Delegate::requires_runspace
pub trait Delegate: Send + Sync {
    fn language(&self) -> ScriptLanguage;

    fn requires_runspace(&self) -> bool {
        false
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a mut KestrunContext,
        runspace: Option<RunspaceLease>,
        next: Next,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Resolves a handler source into a delegate.
///
/// # Errors
///
/// `ScriptCompilation` if the source does not compile, `Config` if the
/// language does not fit the variant.
pub fn build_delegate(
    source: HandlerSource,
    limits: &ResourceLimits,
    shared: &Arc<SharedStateStore>,
) -> Result<Arc<dyn Delegate>> {
    match source {
        HandlerSource::Interpreted {
            language: ScriptLanguage::JavaScript,
            code,
        } => Ok(Arc::new(JavaScriptDelegate::compile(&code, limits.clone())?)),
        HandlerSource::Compiled {
            language: ScriptLanguage::Rhai,
            code,
            options,
        } => Ok(Arc::new(RhaiDelegate::compile(&code, &options, limits.clone(), Arc::clone(shared))?)),
        HandlerSource::Native(delegate) => Ok(delegate),
        HandlerSource::Interpreted { language, .. } => Err(KestrunError::Config(format!(
            "{} cannot be interpreted",
            language
        ))),
        HandlerSource::Compiled { language, .. } => Err(KestrunError::Config(format!(
            "{} cannot be compiled",
            language
        ))),
    }
}
