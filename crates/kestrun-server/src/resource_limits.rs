//! Resource limits for script execution.
//!
//! This module provides configuration for limiting script execution resources
//! so a runaway handler cannot hold a runspace or a blocking thread forever.

use std::time::Duration;

/// Default per-loop iteration cap for JavaScript. Boa cannot interrupt a
/// running script from outside, so this is what ends a `while (true) {}`.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 10_000_000;

/// Resource limits for script execution.
///
/// These limits apply to every delegate the host builds.
///
/// # Fields
///
/// - `execution_timeout` - Wall-clock bound on one handler invocation (default: 30 seconds)
/// - `max_loop_iterations` - Boa loop iteration limit per script run (default: 10 million)
/// - `max_operations` - Rhai operation budget per script run
/// - `max_call_depth` - Recursion limit for both engines (default: the engine's own, 512 for Boa)
///
/// # Memory Limiting
///
/// Neither engine exposes a heap limit, so only time and work are bounded.
///
/// # Example
///
/// ```
/// use kestrun_server::ResourceLimits;
/// use std::time::Duration;
///
/// let limits = ResourceLimits::new()
///     .with_execution_timeout(Duration::from_secs(5))
///     .with_max_loop_iterations(1_000_000);
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Maximum time allowed for one handler invocation before timeout
    pub execution_timeout: Duration,
    /// Loop iteration limit for JavaScript, `None` for unlimited
    pub max_loop_iterations: Option<u64>,
    /// Operation budget for Rhai, `None` for unlimited
    pub max_operations: Option<u64>,
    /// Maximum call depth, `None` for the engine default
    pub max_call_depth: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            max_loop_iterations: Some(DEFAULT_MAX_LOOP_ITERATIONS),
            max_operations: None,
            max_call_depth: None,
        }
    }
}

impl ResourceLimits {
    /// Creates a new ResourceLimits with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_loop_iterations(mut self, iterations: u64) -> Self {
        self.max_loop_iterations = Some(iterations);
        self
    }

    pub fn with_max_operations(mut self, operations: u64) -> Self {
        self.max_operations = Some(operations);
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = Some(depth);
        self
    }

    /// Execution timeout in whole milliseconds, as reported in errors.
    pub fn execution_timeout_ms(&self) -> u64 {
        u64::try_from(self.execution_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Validates the resource limits configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Execution timeout is zero
    /// - Execution timeout is excessively long (> 1 hour)
    /// - Any work limit is zero
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_timeout.is_zero() {
            return Err("execution timeout must be greater than zero".to_string());
        }

        if self.execution_timeout.as_secs() > 3600 {
            return Err(format!(
                "execution timeout must be <= 1 hour (got {} seconds)",
                self.execution_timeout.as_secs()
            ));
        }

        if self.max_loop_iterations == Some(0) {
            return Err("max loop iterations must be greater than zero".to_string());
        }

        if self.max_operations == Some(0) {
            return Err("max operations must be greater than zero".to_string());
        }

        if self.max_call_depth == Some(0) {
            return Err("max call depth must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resource_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.execution_timeout.as_secs(), 30);
        assert_eq!(limits.max_loop_iterations, Some(DEFAULT_MAX_LOOP_ITERATIONS));
        assert_eq!(limits.max_operations, None);
        assert_eq!(limits.execution_timeout_ms(), 30_000);
    }

    #[test]
    fn test_builder_pattern_chaining() {
        let limits = ResourceLimits::new()
            .with_execution_timeout(Duration::from_millis(5500))
            .with_max_loop_iterations(10)
            .with_max_operations(20)
            .with_max_call_depth(8);

        assert_eq!(limits.execution_timeout.as_millis(), 5500);
        assert_eq!(limits.max_loop_iterations, Some(10));
        assert_eq!(limits.max_operations, Some(20));
        assert_eq!(limits.max_call_depth, Some(8));
    }

    #[test]
    fn test_validate_default() {
        assert!(ResourceLimits::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let limits = ResourceLimits::new().with_execution_timeout(Duration::ZERO);
        let err = limits.validate().unwrap_err();
        assert!(err.contains("greater than zero"));
    }

    #[test]
    fn test_validate_excessive_timeout_fails() {
        let limits = ResourceLimits::new().with_execution_timeout(Duration::from_secs(7200));
        let err = limits.validate().unwrap_err();
        assert!(err.contains("1 hour"));
    }

    #[test]
    fn test_validate_zero_work_limits_fail() {
        assert!(ResourceLimits::new().with_max_loop_iterations(0).validate().is_err());
        assert!(ResourceLimits::new().with_max_operations(0).validate().is_err());
        assert!(ResourceLimits::new().with_max_call_depth(0).validate().is_err());
    }
}
