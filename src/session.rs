//! Single-flight coordination for token refresh
//!
//! At most one refresh runs through a [`RefreshGate`] at a time. The first caller
//! that finds the gate idle becomes the leader and performs the refresh; callers
//! arriving while it runs are queued and settled with the leader's outcome.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Verdict delivered to queued waiters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The session was refreshed; replay with this access token
    Refreshed(String),
    /// The refresh was rejected or the session ended; credentials are gone
    Expired,
    /// The refresh succeeded but its result could not be kept
    Failed(String),
    /// The leader stopped without a verdict; the session is untouched
    Abandoned,
}

#[derive(Default)]
struct GateState {
    refreshing: bool,
    waiters: Vec<oneshot::Sender<Outcome>>,
    /// Bumped on every claim and reset so a stale leader cannot settle a newer round
    generation: u64,
}

/// Refresh flag plus the FIFO list of callers waiting on it
///
/// `waiters` is only non-empty while `refreshing` is set, and both are reset in the
/// same critical section when the leader settles.
#[derive(Default)]
pub struct RefreshGate {
    state: Mutex<GateState>,
}

/// Result of trying to enter the gate
pub enum Admission<'a> {
    /// Caller owns the refresh and must settle the guard
    Leader(LeaderGuard<'a>),
    /// A refresh is in flight; await the receiver for its outcome
    Waiter(oneshot::Receiver<Outcome>),
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the refresh or join the queue behind the current one
    pub fn admit(&self) -> Admission<'_> {
        let mut state = self.state.lock();
        if state.refreshing {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            debug!(waiters = state.waiters.len(), "Refresh in flight, queued request");
            Admission::Waiter(rx)
        } else {
            state.refreshing = true;
            state.generation += 1;
            Admission::Leader(LeaderGuard {
                gate: self,
                generation: state.generation,
                settled: false,
            })
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().refreshing
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Tear down session state: expire any waiters and release the flag
    ///
    /// A leader admitted before the reset can no longer commit or settle.
    pub fn reset(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };
        Self::notify(waiters, Outcome::Expired);
    }

    fn settle(&self, generation: u64, outcome: Outcome) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return 0;
            }
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };
        Self::notify(waiters, outcome)
    }

    fn notify(waiters: Vec<oneshot::Sender<Outcome>>, outcome: Outcome) -> usize {
        let count = waiters.len();
        for waiter in waiters {
            // A waiter whose request was dropped no longer listens
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}

/// Exclusive right to perform the in-flight refresh
///
/// Dropping the guard without settling it hands waiters [`Outcome::Abandoned`], so a
/// cancelled leader never leaves the gate stuck.
pub struct LeaderGuard<'a> {
    gate: &'a RefreshGate,
    generation: u64,
    settled: bool,
}

impl LeaderGuard<'_> {
    /// Whether the gate has not been reset since this guard was issued
    pub fn is_current(&self) -> bool {
        self.gate.state.lock().generation == self.generation
    }

    /// Run `commit` only if the round is still current
    ///
    /// The gate lock is held while `commit` runs, so a concurrent [`RefreshGate::reset`]
    /// either happens before (and `commit` is skipped) or after it.
    pub fn commit<T>(&self, commit: impl FnOnce() -> T) -> Option<T> {
        let state = self.gate.state.lock();
        (state.generation == self.generation).then(commit)
    }

    /// Resolve all waiters with the new access token; returns how many were woken
    pub fn succeed(self, access_token: &str) -> usize {
        self.settle(Outcome::Refreshed(access_token.to_string()))
    }

    /// Tell all waiters the session is over; returns how many were woken
    pub fn expire(self) -> usize {
        self.settle(Outcome::Expired)
    }

    /// Tell all waiters the refresh result was lost; returns how many were woken
    pub fn fail(self, reason: impl Into<String>) -> usize {
        self.settle(Outcome::Failed(reason.into()))
    }

    fn settle(mut self, outcome: Outcome) -> usize {
        self.settled = true;
        self.gate.settle(self.generation, outcome)
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.gate.settle(self.generation, Outcome::Abandoned);
        }
    }
}
