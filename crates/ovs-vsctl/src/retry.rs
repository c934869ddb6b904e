//! Commit-and-retry loop

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use ovs_idl::TxnStatus;

use crate::error::{Result, VsctlError};
use crate::handle::Vsctl;
use crate::txn::VsctlTxn;

/// Bounds on [`Vsctl::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Commit attempts before failing with `RetriesExhausted`
    pub max_attempts: u32,
    /// Overall time budget including waits for the replica; `None` is unbounded
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            deadline: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

impl Vsctl {
    /// Run `edit` until its transaction commits without a conflict.
    ///
    /// Each attempt composes against a replica at least as fresh as the
    /// last one seen; after `TryAgain` it first waits for the update that
    /// caused the conflict. Any status other than `TryAgain` is returned,
    /// and errors from `edit` abort the attempt and are returned as is.
    pub async fn run<F>(&mut self, mut edit: F) -> Result<TxnStatus>
    where
        F: FnMut(&mut VsctlTxn<'_>) -> Result<()>,
    {
        let policy = self.policy.clone();
        let deadline = policy.deadline.map(|d| Instant::now() + d);
        let mut conflicted_at = None;
        self.last_attempts = 0;

        while self.last_attempts < policy.max_attempts {
            let seen = match conflicted_at {
                None => bounded(deadline, policy.deadline, self.idl.wait_for_seqno(self.seqno)).await?,
                Some(failed) => {
                    bounded(deadline, policy.deadline, self.idl.wait_for_change(failed)).await?
                }
            };
            self.seqno = seen;
            self.last_attempts += 1;

            let status = self.transaction(&mut edit).await?;
            if status != TxnStatus::TryAgain {
                if self.last_attempts > 1 {
                    info!(attempts = self.last_attempts, %status, "Transaction settled after retries");
                }
                return Ok(status);
            }

            debug!(attempt = self.last_attempts, seqno = self.seqno, "Transaction conflicted, retrying");
            conflicted_at = Some(self.seqno);
        }

        Err(VsctlError::RetriesExhausted {
            attempts: self.last_attempts,
        })
    }
}

async fn bounded<T>(
    deadline: Option<Instant>,
    budget: Option<Duration>,
    wait: impl Future<Output = ovs_idl::Result<T>>,
) -> Result<T> {
    match (deadline, budget) {
        (Some(deadline), Some(budget)) => tokio::time::timeout_at(deadline, wait)
            .await
            .map_err(|_| VsctlError::Timeout(budget))?
            .map_err(VsctlError::from),
        _ => Ok(wait.await?),
    }
}
