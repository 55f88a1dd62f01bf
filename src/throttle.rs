use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Method;
use tokio::time::Instant;

use crate::util::lock_unpoisoned;

/// Which requests are spaced out per host, and by how much.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottlePolicy {
    spacing: Duration,
    methods: Vec<Method>,
}

impl ThrottlePolicy {
    /// `GET` requests to one host depart at least 100ms apart.
    pub fn standard() -> Self {
        Self {
            spacing: Duration::from_millis(100),
            methods: vec![Method::GET],
        }
    }

    pub fn disabled() -> Self {
        Self {
            spacing: Duration::ZERO,
            methods: Vec::new(),
        }
    }

    pub fn spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    /// Replaces the throttled method set. An empty set disables the gate.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn applies_to(&self, method: &Method) -> bool {
        !self.spacing.is_zero() && self.methods.contains(method)
    }

    pub fn configured_spacing(&self) -> Duration {
        self.spacing
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Fixed-spacing departure gate keyed by host.
///
/// Each host maps to the instant its most recent request was allowed to
/// depart. Reserving a slot reads and advances that instant under one lock,
/// so concurrent requests to a host always get distinct slots at least
/// `spacing` apart. Entries whose window has passed are dropped on the next
/// reservation.
///
/// A waiter dropped before its slot arrives hands the slot back, provided
/// no later request has reserved behind it. Otherwise the gap stays.
#[derive(Debug)]
pub(crate) struct HostThrottle {
    policy: ThrottlePolicy,
    departures: Mutex<HashMap<String, Instant>>,
}

impl HostThrottle {
    pub(crate) fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            departures: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves the next departure slot for `host`, or `None` when `method`
    /// is not throttled.
    pub(crate) fn reserve(&self, method: &Method, host: &str) -> Option<Instant> {
        if !self.policy.applies_to(method) {
            return None;
        }

        let spacing = self.policy.spacing;
        let now = Instant::now();
        let mut departures = lock_unpoisoned(&self.departures);
        departures.retain(|_, departed| *departed + spacing > now);

        let departure = match departures.get(host) {
            Some(previous) => (*previous + spacing).max(now),
            None => now,
        };
        departures.insert(host.to_owned(), departure);
        Some(departure)
    }

    /// Gives back the slot at `departure` if it is still the latest one
    /// reserved for `host`.
    pub(crate) fn release(&self, host: &str, departure: Instant) {
        let mut departures = lock_unpoisoned(&self.departures);
        if departures.get(host) != Some(&departure) {
            return;
        }
        match departure.checked_sub(self.policy.spacing) {
            Some(previous) => {
                departures.insert(host.to_owned(), previous);
            }
            None => {
                departures.remove(host);
            }
        }
    }

    /// Waits until `host` may receive another `method` request.
    ///
    /// Dropping the returned future before it completes releases the slot.
    pub(crate) async fn acquire(&self, method: &Method, host: &str) {
        let Some(departure) = self.reserve(method, host) else {
            return;
        };
        let mut slot = PendingSlot {
            throttle: self,
            host,
            departure,
            departed: false,
        };

        #[cfg(feature = "tracing")]
        {
            let wait = departure.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                tracing::trace!(host, wait_ms = wait.as_millis() as u64, "throttling request");
            }
        }

        tokio::time::sleep_until(departure).await;
        slot.departed = true;
    }

    pub(crate) fn tracked_hosts(&self) -> usize {
        let now = Instant::now();
        let spacing = self.policy.spacing;
        let mut departures = lock_unpoisoned(&self.departures);
        departures.retain(|_, departed| *departed + spacing > now);
        departures.len()
    }
}

struct PendingSlot<'a> {
    throttle: &'a HostThrottle,
    host: &'a str,
    departure: Instant,
    departed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.departed {
            self.throttle.release(self.host, self.departure);
        }
    }
}
