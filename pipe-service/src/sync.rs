// Coordination between the background reader and blocked callers.
//
// One `CallTracker` lives inside each connected endpoint. A caller that
// issues a blocking operation increments the depth counter and then polls
// until the depth drops back below the value it captured, a timeout
// elapses, or the peer is observed dead. The reader never blocks: while a
// call is outstanding it parks inbound lines in the single pending slot,
// and the blocked caller drains that slot from its poll loop. Draining is
// what lets nested blocking calls issued by handlers complete while an
// outer call is still waiting.

use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The latest `success`/`error` reply observed by the reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallReply {
    pub error: bool,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The depth dropped below the caller's captured value.
    Answered,
    /// The maximum wait elapsed with no reply.
    TimedOut,
    /// The liveness probe reported the peer gone.
    PeerGone,
}

#[derive(Debug, Default)]
pub struct CallTracker {
    depth: AtomicU32,
    reply: Mutex<Option<CallReply>>,
    pending: Mutex<Option<String>>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Increment the depth and return the new value; the caller waits for
    /// the depth to drop back below it.
    pub fn enter(&self) -> u32 {
        let old = self.depth.fetch_add(1, Ordering::SeqCst);
        debug!("[SYNC] depth {} -> {}", old, old + 1);
        old + 1
    }

    /// Decrement the depth, clamping at zero.
    pub fn decrement(&self) {
        let old = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        if old > 0 {
            debug!("[SYNC] depth {} -> {}", old, old - 1);
        }
    }

    /// Store a reply and unwind the most recent waiter.
    pub fn settle(&self, reply: CallReply) {
        *self.reply.lock().unwrap() = Some(reply);
        self.decrement();
    }

    /// Give up the depth taken by `enter` without producing a reply.
    pub fn abandon(&self) {
        self.decrement();
    }

    /// Consume the reply slot; an empty slot yields the default reply
    /// (no error, no text), which callers treat as an ambiguous outcome.
    pub fn take_reply(&self) -> CallReply {
        self.reply.lock().unwrap().take().unwrap_or_default()
    }

    /// Park an inbound line for the blocked caller to drain. A still
    /// unconsumed line is replaced; the poll loop drains every millisecond
    /// so in practice the slot never holds more than one line.
    pub fn queue_line(&self, line: String) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(old) = pending.as_ref() {
            debug!("[SYNC] pending line \"{}\" replaced by \"{}\"", old, line);
        }
        *pending = Some(line);
    }

    pub fn take_line(&self) -> Option<String> {
        self.pending.lock().unwrap().take()
    }

    /// Poll until the call entered at `entered` is answered, `max_wait`
    /// elapses, or `alive` turns false. Pending lines are handed to `drain`
    /// as they appear and reset the elapsed clock.
    pub async fn wait_for_reply<D, F, A>(
        &self,
        entered: u32,
        max_wait: Duration,
        mut drain: D,
        mut alive: A,
    ) -> WaitOutcome
    where
        D: FnMut(String) -> F,
        F: Future<Output = ()>,
        A: FnMut() -> bool,
    {
        let mut clock = Instant::now();
        loop {
            if let Some(line) = self.take_line() {
                drain(line).await;
                clock = Instant::now();
                continue;
            }
            if self.depth() < entered {
                return WaitOutcome::Answered;
            }
            if clock.elapsed() > max_wait {
                return WaitOutcome::TimedOut;
            }
            if !alive() {
                return WaitOutcome::PeerGone;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
