//! Recorder configuration.

/// Behavior when a tracing operation is attempted with no open entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextMissing {
    /// Log a warning and treat the operation as a no-op.
    #[default]
    LogError,
    /// Surface the failure to the caller as an [`Error`](crate::Error).
    RuntimeError,
}

/// Behavior when the collector daemon is unreachable at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartupPolicy {
    /// Disable tracing for the process and keep running.
    #[default]
    SoftFail,
    /// Abort recorder construction with the probe error.
    HardFail,
}

/// The configuration surface consumed by
/// [`RecorderBuilder`](crate::RecorderBuilder).
#[derive(Clone, Debug)]
pub struct Config {
    /// Service identity used as the segment name for inbound requests and
    /// as the `service_name` fed to sampling rules.
    pub service: String,
    /// Process-wide tracing switch. Forced off when the startup probe fails
    /// under [`StartupPolicy::SoftFail`].
    pub enabled: bool,
    /// Recorder-level sampling switch; off means every request is traced.
    pub sampling: bool,
    /// `host:port` of the collector daemon.
    pub daemon_address: String,
    /// Behavior when no entity is open.
    pub context_missing: ContextMissing,
    /// Behavior when the daemon is unreachable at startup.
    pub startup: StartupPolicy,
    /// Bound on recorded exception-chain depth.
    pub max_cause_depth: usize,
    /// Logical call-site identifiers resolved against the
    /// [`InstrumentationRegistry`](crate::InstrumentationRegistry) at
    /// composition time.
    pub instrument: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service: "unnamed-service".to_string(),
            enabled: true,
            sampling: true,
            daemon_address: "127.0.0.1:2000".to_string(),
            context_missing: ContextMissing::default(),
            startup: StartupPolicy::default(),
            max_cause_depth: 10,
            instrument: Vec::new(),
        }
    }
}
