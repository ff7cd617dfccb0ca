pub mod pool;
pub mod runspace;

mod bindings;
mod conversions;


pub use pool::{PoolConfig, RunspaceLease, RunspacePool};
pub use runspace::{JsProgram, Runspace, ScriptInput, ScriptOutput};
