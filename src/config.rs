//! Client configuration and the `MAVSDK_FTP_DEBUGGING` toggle (spec §4.8, §6).

/// Number of retransmissions attempted before a work item times out
/// (spec §3, §7).
pub const RETRIES: u8 = 4;

/// Default per-request timeout, in seconds, used to arm the engine's timer
/// (spec §4.2, §6 `timeout_s()`).
const DEFAULT_TIMEOUT_SECS: u64 = 1;

/// Identity and timing a concrete [`crate::FtpTransport`] implementation
/// typically embeds to answer its trait methods (spec §4.8, §6). `FtpClient`
/// itself never constructs or stores one directly — it reads
/// `own_system_id`/`target_system_id`/`timeout` etc. straight off whatever
/// transport it's given, so this struct exists for callers who want a
/// ready-made place to keep those values rather than scattering fields
/// across their own transport type.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our own system id, used as the source of every outbound frame.
    pub own_system_id: u8,
    /// Our own component id, used as the source of every outbound frame.
    pub own_component_id: u8,
    /// The paired vehicle's system id.
    pub target_system_id: u8,
    /// The paired vehicle's component id. Defaults to the autopilot
    /// component of `target_system_id`; an explicit override sticks for the
    /// client's lifetime (spec §4.8).
    pub target_component_id: u8,
    /// Per-request timeout before a retransmission is attempted.
    pub timeout: std::time::Duration,
    /// Retries per work item before a `Timeout` is delivered.
    pub retries: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            own_system_id: 245,
            own_component_id: 190,
            target_system_id: 1,
            target_component_id: 1,
            timeout: std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: RETRIES,
        }
    }
}

/// `true` when `MAVSDK_FTP_DEBUGGING=1` is set in the environment, per
/// spec §6. Any other value, or its absence, disables verbose tracing.
pub fn debugging_enabled() -> bool {
    std::env::var("MAVSDK_FTP_DEBUGGING")
        .map(|v| v == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_constants() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.retries, RETRIES);
        assert_eq!(cfg.retries, 4);
    }

    #[test]
    fn debugging_flag_requires_exact_value() {
        // SAFETY: tests run single-threaded within this process by default
        // for this module; no other test reads this variable.
        unsafe {
            std::env::remove_var("MAVSDK_FTP_DEBUGGING");
        }
        assert!(!debugging_enabled());
        unsafe {
            std::env::set_var("MAVSDK_FTP_DEBUGGING", "yes");
        }
        assert!(!debugging_enabled());
        unsafe {
            std::env::set_var("MAVSDK_FTP_DEBUGGING", "1");
        }
        assert!(debugging_enabled());
        unsafe {
            std::env::remove_var("MAVSDK_FTP_DEBUGGING");
        }
    }
}
