//! Linked cancellation for calls.
//!
//! Every call runs under a [`CallScope`]: a cancellation token that is a child of the
//! caller's (or server's) token and additionally fires when the call deadline passes.
//! Whichever condition is observed first decides whether the call ends as
//! `Cancelled` or `DeadlineExceeded`.

use crate::status::Status;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit cancel: the caller, a `RequestCancel` from the peer, or the peer going away.
    Cancelled,
    DeadlineExceeded,
}

#[derive(Debug)]
struct ScopeInner {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    deadline: Option<SystemTime>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Cancellation scope of a single call.
#[derive(Debug, Clone)]
pub struct CallScope {
    inner: Arc<ScopeInner>,
}

impl CallScope {
    /// Creates scope linked to `parent` (when given) and to `deadline`.
    ///
    /// Must be called within a tokio runtime when `deadline` is set.
    pub fn new(parent: Option<&CancellationToken>, deadline: Option<SystemTime>) -> CallScope {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let reason = Arc::new(OnceLock::new());
        let timer = deadline.map(|deadline| {
            let token = token.clone();
            let reason = reason.clone();
            let at = instant_of(deadline);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        let _ = reason.set(CancelReason::DeadlineExceeded);
                        trace!("Call deadline reached");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });
        CallScope {
            inner: Arc::new(ScopeInner {
                token,
                reason,
                deadline,
                timer,
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.inner.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether the wall-clock deadline is behind us, whatever the token state.
    pub fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .map_or(false, |deadline| SystemTime::now() >= deadline)
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Explicit cancel. No-op when the scope is already cancelled.
    pub fn cancel(&self) {
        let _ = self.inner.reason.set(CancelReason::Cancelled);
        self.inner.token.cancel();
    }

    /// Why the scope got cancelled, `None` while it is still live.
    ///
    /// Cancellation inherited from a parent token counts as [`CancelReason::Cancelled`].
    pub fn reason(&self) -> Option<CancelReason> {
        match self.inner.token.is_cancelled() {
            true => Some(
                self.inner
                    .reason
                    .get()
                    .copied()
                    .unwrap_or(CancelReason::Cancelled),
            ),
            false => None,
        }
    }

    /// Status reported locally for a cancelled call.
    pub fn status(&self) -> Status {
        match self.reason() {
            Some(CancelReason::DeadlineExceeded) => Status::deadline_exceeded("Deadline exceeded"),
            _ => Status::cancelled("Call cancelled"),
        }
    }

    /// Token firing `grace` after the deadline, or `grace` from now for calls without deadline.
    pub fn grace_token(&self, grace: Duration) -> (CancellationToken, JoinHandle<()>) {
        let at = match self.inner.deadline {
            Some(deadline) => instant_of(deadline + grace),
            None => Instant::now() + grace,
        };
        expiring_token(at)
    }
}

/// Token cancelled once `at` is reached. Abort the returned handle to stop the timer early.
pub fn expiring_token(at: Instant) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let timer_token = token.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep_until(at).await;
        timer_token.cancel();
    });
    (token, timer)
}

/// Monotonic instant matching wall-clock `deadline`. Past deadlines map to now.
pub fn instant_of(deadline: SystemTime) -> Instant {
    let remaining = deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

/// Deadline as unix millis, `0` for none.
///
/// Rounds up, so the peer never expires a call before its originator does.
pub fn deadline_to_millis(deadline: Option<SystemTime>) -> u64 {
    deadline
        .and_then(|deadline| deadline.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |since_epoch| {
            let partial = u128::from(since_epoch.subsec_nanos() % 1_000_000 != 0);
            (since_epoch.as_millis() + partial).max(1) as u64
        })
}

pub fn deadline_from_millis(millis: u64) -> Option<SystemTime> {
    match millis {
        0 => None,
        millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
    }
}
