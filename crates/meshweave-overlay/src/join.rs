//! Join with retry
//!
//! Joining is retried forever with exponential backoff; only shutdown stops
//! it. Each failure is logged with the delay before the next attempt.

use crate::error::{OverlayError, Result};
use crate::membership::MembershipDirectory;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Backoff schedule for join attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinBackoff {
    /// Delay after the first failure
    #[serde(default = "default_initial", with = "humantime_serde")]
    pub initial: Duration,

    /// Upper bound on the delay
    #[serde(default = "default_max", with = "humantime_serde")]
    pub max: Duration,

    /// Growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random extra delay as a fraction of the base delay (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial() -> Duration {
    Duration::from_millis(500)
}

fn default_max() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for JoinBackoff {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            max: default_max(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl JoinBackoff {
    /// Check the schedule makes sense
    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(OverlayError::Config(
                "join backoff initial delay must be positive".to_string(),
            ));
        }
        if self.max < self.initial {
            return Err(OverlayError::Config(
                "join backoff max delay must not be below the initial delay".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(OverlayError::Config(
                "join backoff multiplier must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(OverlayError::Config(
                "join backoff jitter must be within 0..=1".to_string(),
            ));
        }
        Ok(())
    }

    /// Base delay following `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        std::cmp::min(current.mul_f64(self.multiplier), self.max)
    }

    /// `base` plus up to `jitter * base` of random extra delay
    pub fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        base + base.mul_f64(extra)
    }
}

/// Join `directory` through `seeds`, retrying until it succeeds
///
/// Returns the number of contacted nodes, or [`OverlayError::Cancelled`]
/// once `shutdown` flips to `true`.
pub async fn run_join(
    directory: &dyn MembershipDirectory,
    seeds: &[String],
    backoff: &JoinBackoff,
    mut shutdown: watch::Receiver<bool>,
) -> Result<usize> {
    let mut delay = backoff.initial;
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            return Err(OverlayError::Cancelled);
        }
        attempt += 1;

        let result = tokio::select! {
            result = directory.join(seeds) => result,
            _ = wait_for_shutdown(&mut shutdown) => return Err(OverlayError::Cancelled),
        };
        match result {
            Ok(contacted) => {
                info!(attempt, contacted, "Joined cluster");
                return Ok(contacted);
            }
            Err(e) => {
                let retry_in = backoff.jittered(delay);
                warn!(
                    attempt,
                    error = %e,
                    retry_in = ?retry_in,
                    "Join failed, will retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_in) => {}
                    _ = wait_for_shutdown(&mut shutdown) => return Err(OverlayError::Cancelled),
                }
                delay = backoff.next_delay(delay);
            }
        }
    }
}

/// Resolves once shutdown is signalled or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // sender gone, shutdown can no longer be signalled
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::DirectoryPhase;
    use crate::peer::{LocalIdentity, PeerSetSnapshot};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Directory whose join fails a fixed number of times
    struct FlakyDirectory {
        failures: Mutex<u32>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl FlakyDirectory {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl MembershipDirectory for FlakyDirectory {
        fn local_name(&self) -> &str {
            "flaky"
        }

        async fn configure(&self, _identity: &LocalIdentity) -> Result<()> {
            Ok(())
        }

        async fn join(&self, seeds: &[String]) -> Result<usize> {
            self.attempts.lock().push(Instant::now());
            let mut failures = self.failures.lock();
            if *failures == 0 {
                return Ok(seeds.len());
            }
            *failures -= 1;
            Err(OverlayError::NoReachablePeers(seeds.len()))
        }

        fn events(&self) -> Result<mpsc::UnboundedReceiver<PeerSetSnapshot>> {
            Err(OverlayError::EventsTaken)
        }

        async fn leave(&self) -> Result<()> {
            Ok(())
        }

        fn phase(&self) -> DirectoryPhase {
            DirectoryPhase::Configured
        }
    }

    fn no_jitter() -> JoinBackoff {
        JoinBackoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let directory = FlakyDirectory::new(2);
        let (_tx, rx) = watch::channel(false);
        let seeds = vec!["192.168.1.1".to_string()];

        let contacted = run_join(&directory, &seeds, &no_jitter(), rx).await.unwrap();
        assert_eq!(contacted, 1);
        assert_eq!(directory.attempts.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_seed_backs_off_until_cancelled() {
        let directory = std::sync::Arc::new(FlakyDirectory::new(u32::MAX));
        let (tx, rx) = watch::channel(false);

        let task = {
            let directory = std::sync::Arc::clone(&directory);
            tokio::spawn(async move {
                let seeds = vec!["192.168.1.1".to_string()];
                run_join(&*directory, &seeds, &no_jitter(), rx).await
            })
        };

        tokio::time::sleep(Duration::from_secs(20)).await;
        tx.send(true).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(OverlayError::Cancelled)));

        let attempts = directory.attempts.lock().clone();
        assert!(attempts.len() >= 5);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        let close = |gap: Duration, expected: Duration| {
            gap >= expected && gap <= expected + Duration::from_millis(5)
        };
        assert!(close(gaps[0], Duration::from_millis(500)), "{gaps:?}");
        assert!(close(gaps[1], Duration::from_secs(1)), "{gaps:?}");
        assert!(close(gaps[2], Duration::from_secs(2)), "{gaps:?}");
        assert!(close(gaps[3], Duration::from_secs(4)), "{gaps:?}");
        // capped at max
        assert!(gaps[4..].iter().all(|g| close(*g, Duration::from_secs(4))), "{gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled() {
        let directory = FlakyDirectory::new(0);
        let (_tx, rx) = watch::channel(true);
        let result = run_join(&directory, &[], &no_jitter(), rx).await;
        assert!(matches!(result, Err(OverlayError::Cancelled)));
        assert!(directory.attempts.lock().is_empty());
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = JoinBackoff::default();
        let base = Duration::from_secs(2);
        for _ in 0..100 {
            let d = backoff.jittered(base);
            assert!(d >= base && d <= base.mul_f64(1.5));
        }
    }

    #[test]
    fn test_validate() {
        assert!(JoinBackoff::default().validate().is_ok());
        let bad = JoinBackoff {
            multiplier: 0.5,
            ..JoinBackoff::default()
        };
        assert!(bad.validate().is_err());
        let bad = JoinBackoff {
            max: Duration::from_millis(1),
            ..JoinBackoff::default()
        };
        assert!(bad.validate().is_err());
    }
}
