//! Runtime configuration for a catamaran server.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 500;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 250;
/// Default session timeout, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT: u64 = 5_000;
/// Default minor compaction interval, in milliseconds.
pub const DEFAULT_MINOR_COMPACTION_INTERVAL: u64 = 60_000;
/// Default major compaction interval, in milliseconds.
pub const DEFAULT_MAJOR_COMPACTION_INTERVAL: u64 = 3_600_000;
/// Default number of entries per log segment.
pub const DEFAULT_SEGMENT_ENTRIES: u32 = 1024;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default delay between leader probes while joining or routing, in milliseconds.
pub const DEFAULT_PROBE_DELAY: u64 = 100;
/// Default number of probe rounds before a join or client request times out.
pub const DEFAULT_PROBE_ROUNDS: u64 = 50;

/// The runtime configuration for a catamaran cluster.
///
/// All servers of a cluster are expected to run with the same configuration;
/// timing related values (the session timeout above all) feed into the
/// replicated log's deterministic clock and must agree across members.
///
/// Use [`Config::build`] to construct and [`ConfigBuilder::validate`] to
/// check and finalize an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of the cluster, used for logging.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    ///
    /// Concrete timeouts are randomized per §5.2 of the Raft spec into
    /// `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: u64,
    /// The leader heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
    /// The session timeout in milliseconds, measured against the log clock.
    pub session_timeout: u64,
    /// The interval between minor compaction passes, in milliseconds.
    pub minor_compaction_interval: u64,
    /// The interval between major compaction passes, in milliseconds.
    pub major_compaction_interval: u64,
    /// The number of entry slots per log segment.
    pub segment_entries: u32,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The delay between consecutive leader probes, in milliseconds.
    pub probe_delay: u64,
    /// The number of probe rounds before joining or a client request gives up.
    pub probe_rounds: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout: None,
            heartbeat_interval: None,
            session_timeout: None,
            minor_compaction_interval: None,
            major_compaction_interval: None,
            segment_entries: None,
            max_payload_entries: None,
            probe_delay: None,
            probe_rounds: None,
        }
    }

    /// Generate a new random election timeout within the configured band.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout..(self.election_timeout * 2))
    }
}

/// A builder for the `Config` type.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    session_timeout: Option<u64>,
    minor_compaction_interval: Option<u64>,
    major_compaction_interval: Option<u64>,
    segment_entries: Option<u32>,
    max_payload_entries: Option<u64>,
    probe_delay: Option<u64>,
    probe_rounds: Option<u64>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the session timeout in milliseconds.
    pub fn session_timeout(mut self, val: u64) -> Self {
        self.session_timeout = Some(val);
        self
    }

    /// Set the minor compaction interval in milliseconds.
    pub fn minor_compaction_interval(mut self, val: u64) -> Self {
        self.minor_compaction_interval = Some(val);
        self
    }

    /// Set the major compaction interval in milliseconds.
    pub fn major_compaction_interval(mut self, val: u64) -> Self {
        self.major_compaction_interval = Some(val);
        self
    }

    /// Set the number of entry slots per log segment.
    pub fn segment_entries(mut self, val: u32) -> Self {
        self.segment_entries = Some(val);
        self
    }

    /// Set the maximum number of entries per replication payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the delay between consecutive leader probes, in milliseconds.
    pub fn probe_delay(mut self, val: u64) -> Self {
        self.probe_delay = Some(val);
        self
    }

    /// Set the number of probe rounds before giving up.
    pub fn probe_rounds(mut self, val: u64) -> Self {
        self.probe_rounds = Some(val);
        self
    }

    /// Validate the state of this builder & produce a new `Config` instance.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout = self.election_timeout.unwrap_or(DEFAULT_ELECTION_TIMEOUT);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let session_timeout = self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);
        let minor_compaction_interval = self.minor_compaction_interval.unwrap_or(DEFAULT_MINOR_COMPACTION_INTERVAL);
        let major_compaction_interval = self.major_compaction_interval.unwrap_or(DEFAULT_MAJOR_COMPACTION_INTERVAL);
        let segment_entries = self.segment_entries.unwrap_or(DEFAULT_SEGMENT_ENTRIES);
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        let probe_delay = self.probe_delay.unwrap_or(DEFAULT_PROBE_DELAY);
        let probe_rounds = self.probe_rounds.unwrap_or(DEFAULT_PROBE_ROUNDS);

        if election_timeout == 0 {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if heartbeat_interval >= election_timeout {
            return Err(ConfigError::HeartbeatTooLong);
        }
        if session_timeout <= heartbeat_interval {
            return Err(ConfigError::SessionTimeoutTooShort);
        }
        if segment_entries == 0 {
            return Err(ConfigError::InvalidSegmentSize);
        }
        if max_payload_entries == 0 {
            return Err(ConfigError::InvalidMaxPayloadEntries);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout,
            heartbeat_interval,
            session_timeout,
            minor_compaction_interval,
            major_compaction_interval,
            segment_entries,
            max_payload_entries,
            probe_delay,
            probe_rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::build("test".into()).validate().unwrap();
        assert_eq!(cfg.election_timeout, DEFAULT_ELECTION_TIMEOUT);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.session_timeout, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(cfg.segment_entries, DEFAULT_SEGMENT_ENTRIES);
    }

    #[test]
    fn rand_election_timeout_stays_in_band() {
        let cfg = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout);
            assert!(t < cfg.election_timeout * 2);
        }
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let res = Config::build("test".into()).election_timeout(100).heartbeat_interval(100).validate();
        assert!(matches!(res, Err(ConfigError::HeartbeatTooLong)));
    }

    #[test]
    fn session_timeout_must_exceed_heartbeat() {
        let res = Config::build("test".into())
            .election_timeout(500)
            .heartbeat_interval(250)
            .session_timeout(200)
            .validate();
        assert!(matches!(res, Err(ConfigError::SessionTimeoutTooShort)));
    }

    #[test]
    fn zero_segment_size_is_rejected() {
        let res = Config::build("test".into()).segment_entries(0).validate();
        assert!(matches!(res, Err(ConfigError::InvalidSegmentSize)));
    }
}
