//! Protocol timing table.
//!
//! Every deadline in the system — election probes, phase lengths,
//! retransmission intervals — comes from one TOML file loaded at startup.
//! All keys are unsigned millisecond counts and all of them are required;
//! a missing key is a fatal configuration error.

use {
    crate::error::{CoreError, Result},
    serde::Deserialize,
    std::{path::Path, time::Duration},
};

/// The full timing table. Field names match the keys in the timings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(non_snake_case)]
pub struct Timings {
    /// How long a coordinator waits for Are-You-Coordinator responses.
    pub GM_AYC_RESPONSE_TIMEOUT: u64,
    /// How long a member waits for an Are-You-There response.
    pub GM_AYT_RESPONSE_TIMEOUT: u64,
    /// How long a new leader waits for invitation accepts.
    pub GM_INVITE_RESPONSE_TIMEOUT: u64,
    /// Interval between coordinator AYC probe rounds.
    pub GM_CHECK_TIMEOUT: u64,
    /// Upper bound guarding the whole election from hanging.
    pub GM_GLOBAL_TIMEOUT: u64,
    /// Interval between FID state checks.
    pub GM_FID_TIMEOUT: u64,
    /// Scheduler phase length for the group-management module.
    pub GM_PHASE_TIME: u64,
    /// Shortest premerge backoff.
    pub GM_PREMERGE_MIN_TIMEOUT: u64,
    /// Longest premerge backoff.
    pub GM_PREMERGE_MAX_TIMEOUT: u64,
    /// Number of distinct premerge backoff slots.
    pub GM_PREMERGE_GRANULARITY: u64,
    /// Interval between member AYT probe rounds.
    pub GM_TIMEOUT_TIMEOUT: u64,
    /// Scheduler phase length for the state-collection module.
    pub SC_PHASE_TIME: u64,
    /// Scheduler phase length for the load-balance module.
    pub LB_PHASE_TIME: u64,
    /// Interval between load-balance rounds within a phase.
    pub LB_ROUND_TIME: u64,
    /// How long the load balancer waits on a state request.
    pub LB_REQUEST_TIMEOUT: u64,
    /// Interval between clock-synchronizer exchanges.
    pub CS_EXCHANGE_TIME: u64,
    /// Default expiration applied to reliable sends.
    pub CSRC_DEFAULT_TIMEOUT: u64,
    /// Retransmission interval for the reliable protocols.
    pub CSRC_RESEND_TIME: u64,
    /// Retransmission interval for the best-effort protocol.
    pub CSUC_RESEND_TIME: u64,
}

impl Timings {
    /// Load the table from a TOML file. Missing or malformed keys fail.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read timings file {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// Parse the table from TOML text.
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CoreError::Config(format!("timings file: {e}")))
    }

    /// A table with short intervals suitable for local testing.
    pub fn dev_default() -> Self {
        Timings {
            GM_AYC_RESPONSE_TIMEOUT: 100,
            GM_AYT_RESPONSE_TIMEOUT: 100,
            GM_INVITE_RESPONSE_TIMEOUT: 100,
            GM_CHECK_TIMEOUT: 300,
            GM_GLOBAL_TIMEOUT: 2_000,
            GM_FID_TIMEOUT: 500,
            GM_PHASE_TIME: 200,
            GM_PREMERGE_MIN_TIMEOUT: 20,
            GM_PREMERGE_MAX_TIMEOUT: 120,
            GM_PREMERGE_GRANULARITY: 10,
            GM_TIMEOUT_TIMEOUT: 300,
            SC_PHASE_TIME: 200,
            LB_PHASE_TIME: 200,
            LB_ROUND_TIME: 50,
            LB_REQUEST_TIMEOUT: 500,
            CS_EXCHANGE_TIME: 1_000,
            CSRC_DEFAULT_TIMEOUT: 1_000,
            CSRC_RESEND_TIME: 10,
            CSUC_RESEND_TIME: 10,
        }
    }

    /// Phase rotation as `(module, phase duration)` pairs, in the order the
    /// scheduler registers them.
    pub fn phase_table(&self) -> Vec<(String, Duration)> {
        vec![
            ("gm".to_string(), Duration::from_millis(self.GM_PHASE_TIME)),
            ("sc".to_string(), Duration::from_millis(self.SC_PHASE_TIME)),
            ("lb".to_string(), Duration::from_millis(self.LB_PHASE_TIME)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_table() -> String {
        let keys = [
            "GM_AYC_RESPONSE_TIMEOUT",
            "GM_AYT_RESPONSE_TIMEOUT",
            "GM_INVITE_RESPONSE_TIMEOUT",
            "GM_CHECK_TIMEOUT",
            "GM_GLOBAL_TIMEOUT",
            "GM_FID_TIMEOUT",
            "GM_PHASE_TIME",
            "GM_PREMERGE_MIN_TIMEOUT",
            "GM_PREMERGE_MAX_TIMEOUT",
            "GM_PREMERGE_GRANULARITY",
            "GM_TIMEOUT_TIMEOUT",
            "SC_PHASE_TIME",
            "LB_PHASE_TIME",
            "LB_ROUND_TIME",
            "LB_REQUEST_TIMEOUT",
            "CS_EXCHANGE_TIME",
            "CSRC_DEFAULT_TIMEOUT",
            "CSRC_RESEND_TIME",
            "CSUC_RESEND_TIME",
        ];
        keys.iter()
            .map(|k| format!("{k} = 100\n"))
            .collect::<String>()
    }

    #[test]
    fn test_parse_full_table() {
        let t = Timings::parse(&full_table()).unwrap();
        assert_eq!(t.GM_CHECK_TIMEOUT, 100);
        assert_eq!(t.CSUC_RESEND_TIME, 100);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let raw = full_table().replace("GM_GLOBAL_TIMEOUT = 100\n", "");
        let err = Timings::parse(&raw).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(err.to_string().contains("GM_GLOBAL_TIMEOUT"));
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let raw = format!("{}BOGUS_KEY = 5\n", full_table());
        assert!(Timings::parse(&raw).is_err());
    }

    #[test]
    fn test_phase_table_order() {
        let t = Timings::dev_default();
        let names: Vec<String> = t.phase_table().into_iter().map(|(m, _)| m).collect();
        assert_eq!(names, vec!["gm", "sc", "lb"]);
    }
}
