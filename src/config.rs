use derive_builder::Builder;
use std::path::PathBuf;

/// Engine configuration.
///
/// Knobs are deliberately few: scheduling class, verbosity, the non-realtime
/// client timeout, the port-table capacity, and the two filesystem roots the
/// engine rendezvouses through.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct EngineConfig {
    /// Run the cycle thread under SCHED_FIFO and start the watchdog.
    #[builder(default = "false")]
    pub realtime: bool,

    /// Realtime priority for the cycle thread, clamped to `1..=98`.
    /// Clients are offered `rtpriority - 1`; the watchdog runs at
    /// `min(99, rtpriority + 10)`.
    #[builder(default = "10")]
    pub rtpriority: i32,

    /// Emit per-cycle and per-sort diagnostics at debug level.
    #[builder(default = "false")]
    pub verbose: bool,

    /// How long to wait for an external subgraph when not running
    /// realtime, in milliseconds. Realtime waits are bounded by the
    /// driver period instead.
    #[builder(default = "500")]
    pub client_timeout_msecs: u32,

    /// Capacity of the shared port table.
    #[builder(default = "128")]
    pub port_max: u32,

    /// Directory for listening sockets and subgraph FIFOs. Stale `jack-*`
    /// and `jack_*` entries are deleted here on startup.
    #[builder(default = "std::env::temp_dir()")]
    pub server_dir: PathBuf,

    /// Directory backing the named shared-memory segments.
    #[builder(default = "PathBuf::from(\"/dev/shm\")")]
    pub shm_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::default()
            .build()
            .expect("all config fields have defaults")
    }
}

impl EngineConfig {
    /// Priority clamped to the range the scheduler accepts.
    pub fn clamped_rtpriority(&self) -> i32 {
        self.rtpriority.clamp(1, 98)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert!(!cfg.realtime);
        assert_eq!(cfg.port_max, 128);
        assert_eq!(cfg.client_timeout_msecs, 500);
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = EngineConfigBuilder::default()
            .realtime(true)
            .rtpriority(120)
            .port_max(16u32)
            .build()
            .unwrap();
        assert!(cfg.realtime);
        assert_eq!(cfg.clamped_rtpriority(), 98);
        assert_eq!(cfg.port_max, 16);
    }
}
