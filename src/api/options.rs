use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    pub leader_install_snapshot_timeout: Option<Duration>,
    /// Deadline for client-facing calls (writes, reads, configuration changes). A request that
    /// can't commit within this window fails with a retryable timeout instead of hanging.
    pub client_request_timeout: Option<Duration>,
    /// Take a snapshot automatically once this many entries have been applied past the previous
    /// snapshot. None (the default) means snapshots are only taken on demand.
    pub snapshot_after_applied_entries: Option<u64>,
    /// Seeds the election timeout jitter. Two runs with the same seed and the same message
    /// timing elect leaders in the same order. None draws from OS entropy.
    pub random_seed: Option<u64>,
}

pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub leader_install_snapshot_timeout: Duration,
    pub client_request_timeout: Duration,
    pub snapshot_after_applied_entries: Option<u64>,
    pub random_seed: Option<u64>,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.leader_install_snapshot_timeout < self.leader_append_entries_timeout {
            return Err("Snapshot transfers must be allowed at least as long as a log append");
        }
        if self.client_request_timeout <= self.follower_max_timeout {
            return Err("Client request timeout must be greater than the follower's maximum timeout");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            leader_install_snapshot_timeout: options
                .leader_install_snapshot_timeout
                .unwrap_or(Duration::from_secs(5)),
            client_request_timeout: options.client_request_timeout.unwrap_or(Duration::from_secs(5)),
            snapshot_after_applied_entries: options.snapshot_after_applied_entries,
            random_seed: options.random_seed,
        };

        values.validate()?;
        Ok(values)
    }
}
