//! Outbound connection supervision.
//!
//! Every outbound peer gets one controller that dials, hands the connection
//! to the replication layer, and redials when it ends. The first retry
//! after a working connection (and the very first retry overall) happens
//! immediately; further retries back off along a capped fibonacci sequence.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

const INITIAL_DELAY: Duration = Duration::from_secs(3);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Capped fibonacci delays: 3s, 3s, 6s, 9s, 15s, 24s, then 30s forever.
#[derive(Debug)]
pub struct FibonacciBackoff {
    previous: Duration,
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        FibonacciBackoff {
            previous: Duration::ZERO,
            current: initial,
            initial,
            max,
        }
    }

    /// The next delay, advancing the sequence. Stops advancing at the cap,
    /// so arbitrarily long outages cannot overflow the sum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        if self.current < self.max {
            let next = self.previous + self.current;
            self.previous = self.current;
            self.current = next;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.previous = Duration::ZERO;
        self.current = self.initial;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        FibonacciBackoff::new(INITIAL_DELAY, MAX_DELAY)
    }
}

/// Dials `connect` forever.
///
/// `connect` covers one whole connection: it resolves `Ok` when a healthy
/// connection ended (peer went away) and `Err` when dialing or the session
/// failed. Never returns; callers drop the task to stop it.
pub async fn run_outbound<C, Fut>(peer: &str, mut connect: C)
where
    C: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = FibonacciBackoff::default();
    let mut attempts: u64 = 0;
    loop {
        match connect().await {
            Ok(()) => {
                info!(peer, "connection closed");
                backoff.reset();
                attempts = 0;
            }
            Err(err) => {
                warn!(peer, err = format!("{err:#}"), "connection failed");
            }
        }
        if attempts == 0 {
            attempts += 1;
            debug!(peer, "retrying immediately");
            continue;
        }
        attempts += 1;
        let delay = backoff.next_delay();
        info!(peer, ?delay, "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}
