use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::beacon::{ForkScheduleProvider, GenesisProvider, SpecProvider};

/// Converts between wall-clock time and slot/epoch indices, anchored to the
/// network's genesis time.
///
/// Immutable after construction; all parameters are read once from an
/// upstream node at startup.
pub struct ChainTime {
    genesis: SystemTime,
    slot_duration: Duration,
    slots_per_epoch: u64,
}

impl std::fmt::Debug for ChainTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainTime")
            .field("slot_duration", &self.slot_duration)
            .field("slots_per_epoch", &self.slots_per_epoch)
            .finish()
    }
}

impl ChainTime {
    /// Creates a chain time service from an upstream node's genesis, spec and
    /// fork schedule.
    pub async fn new<C>(client: &C) -> Result<Self>
    where
        C: GenesisProvider + SpecProvider + ForkScheduleProvider,
    {
        let genesis = client
            .genesis()
            .await
            .context("failed to obtain genesis time")?;

        let spec = client.spec().await.context("failed to obtain spec")?;

        let forks = client
            .fork_schedule()
            .await
            .context("failed to obtain fork schedule")?;
        debug!(forks = forks.len(), "fetched fork schedule");

        Self::from_parts(
            genesis.genesis_time,
            Duration::from_secs(spec.seconds_per_slot),
            spec.slots_per_epoch,
        )
    }

    /// Creates a chain time service from already-known parameters.
    pub fn from_parts(
        genesis: SystemTime,
        slot_duration: Duration,
        slots_per_epoch: u64,
    ) -> Result<Self> {
        if slot_duration.is_zero() {
            bail!("slot duration must be > 0");
        }

        if slots_per_epoch == 0 {
            bail!("slots per epoch must be > 0");
        }

        Ok(Self {
            genesis,
            slot_duration,
            slots_per_epoch,
        })
    }

    /// The wall-clock instant at which slot 0 begins.
    pub fn genesis_time(&self) -> SystemTime {
        self.genesis
    }

    pub fn slots_per_epoch(&self) -> u64 {
        self.slots_per_epoch
    }

    /// The wall-clock start of the given slot.
    pub fn start_of_slot(&self, slot: u64) -> SystemTime {
        let offset = slot.saturating_mul(self.slot_duration.as_millis() as u64);
        self.genesis + Duration::from_millis(offset)
    }

    /// The wall-clock start of the given epoch.
    pub fn start_of_epoch(&self, epoch: u64) -> SystemTime {
        self.start_of_slot(epoch.saturating_mul(self.slots_per_epoch))
    }

    /// The slot in progress now. 0 before genesis.
    pub fn current_slot(&self) -> u64 {
        self.timestamp_to_slot(SystemTime::now())
    }

    /// The epoch in progress now. 0 before genesis.
    pub fn current_epoch(&self) -> u64 {
        self.current_slot() / self.slots_per_epoch
    }

    /// The slot in progress at the given timestamp. 0 before genesis.
    pub fn timestamp_to_slot(&self, timestamp: SystemTime) -> u64 {
        match timestamp.duration_since(self.genesis) {
            Ok(elapsed) => (elapsed.as_millis() / self.slot_duration.as_millis()) as u64,
            Err(_) => 0,
        }
    }

    /// The epoch in progress at the given timestamp. 0 before genesis.
    pub fn timestamp_to_epoch(&self, timestamp: SystemTime) -> u64 {
        self.timestamp_to_slot(timestamp) / self.slots_per_epoch
    }

    /// Signed milliseconds between the start of the given slot and `at`.
    /// Negative when the slot has not started yet.
    pub fn millis_since_slot_start(&self, slot: u64, at: SystemTime) -> i64 {
        let start = self.start_of_slot(slot);
        match at.duration_since(start) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    // 2024-01-01T00:00:00Z.
    const GENESIS_UNIX: u64 = 1_704_067_200;

    fn mainnet_like() -> ChainTime {
        ChainTime::from_parts(
            UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX),
            Duration::from_secs(12),
            32,
        )
        .expect("valid params")
    }

    #[test]
    fn test_rejects_zero_slot_duration() {
        let result = ChainTime::from_parts(UNIX_EPOCH, Duration::ZERO, 32);
        assert!(result.is_err());
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("slot duration"));
    }

    #[test]
    fn test_rejects_zero_slots_per_epoch() {
        let result = ChainTime::from_parts(UNIX_EPOCH, Duration::from_secs(12), 0);
        assert!(result.is_err());
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("slots per epoch"));
    }

    #[test]
    fn test_start_of_slot() {
        let ct = mainnet_like();
        assert_eq!(ct.start_of_slot(0), ct.genesis_time());
        // Slot 1000 starts 1000 * 12s = 3h20m after genesis: 03:20:00Z.
        assert_eq!(
            ct.start_of_slot(1000),
            UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX + 12_000),
        );
    }

    #[test]
    fn test_start_of_epoch_matches_slot_boundary() {
        let ct = mainnet_like();
        assert_eq!(ct.start_of_epoch(0), ct.genesis_time());
        for epoch in [1u64, 2, 7, 1000] {
            assert_eq!(ct.start_of_epoch(epoch), ct.start_of_slot(epoch * 32));
        }
    }

    #[test]
    fn test_slot_duration_between_consecutive_slots() {
        let ct = mainnet_like();
        for slot in [0u64, 1, 31, 32, 999, 1_000_000] {
            let gap = ct
                .start_of_slot(slot + 1)
                .duration_since(ct.start_of_slot(slot))
                .expect("monotone");
            assert_eq!(gap, Duration::from_secs(12));
        }
    }

    #[test]
    fn test_timestamp_to_slot_round_trip() {
        let ct = mainnet_like();
        for slot in [0u64, 1, 5, 31, 32, 33, 12_345, 9_999_999] {
            assert_eq!(ct.timestamp_to_slot(ct.start_of_slot(slot)), slot);
        }
    }

    #[test]
    fn test_timestamp_to_slot_within_slot() {
        let ct = mainnet_like();
        // One minute after genesis is 5 slots in.
        let t = UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX + 60);
        assert_eq!(ct.timestamp_to_slot(t), 5);

        // Just before the next boundary stays in the same slot.
        let t = ct.start_of_slot(42) + Duration::from_millis(11_999);
        assert_eq!(ct.timestamp_to_slot(t), 42);
    }

    #[test]
    fn test_pre_genesis_clamps_to_zero() {
        let ct = mainnet_like();
        let before = UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX - 86_400);
        assert_eq!(ct.timestamp_to_slot(before), 0);
        assert_eq!(ct.timestamp_to_epoch(before), 0);
    }

    #[test]
    fn test_timestamp_to_epoch() {
        let ct = mainnet_like();
        assert_eq!(ct.timestamp_to_epoch(ct.genesis_time()), 0);
        assert_eq!(ct.timestamp_to_epoch(ct.start_of_epoch(1)), 1);
        // A millisecond before the epoch 2 boundary is still epoch 1.
        let t = ct.start_of_epoch(2) - Duration::from_millis(1);
        assert_eq!(ct.timestamp_to_epoch(t), 1);
        assert_eq!(ct.timestamp_to_epoch(ct.start_of_epoch(999)), 999);
    }

    #[test]
    fn test_current_slot_tracks_wall_clock() {
        // Genesis 60 seconds ago => slot 5.
        let genesis = SystemTime::now() - Duration::from_secs(60);
        let ct = ChainTime::from_parts(genesis, Duration::from_secs(12), 32).expect("valid params");
        assert_eq!(ct.current_slot(), 5);
        assert_eq!(ct.current_epoch(), 0);
    }

    #[test]
    fn test_millis_since_slot_start() {
        let ct = mainnet_like();
        let at = ct.start_of_slot(7) + Duration::from_millis(300);
        assert_eq!(ct.millis_since_slot_start(7, at), 300);

        // Observation before the slot begins is negative.
        let early = ct.start_of_slot(7) - Duration::from_millis(250);
        assert_eq!(ct.millis_since_slot_start(7, early), -250);
    }
}
