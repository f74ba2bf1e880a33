use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use logtide_hub::{Hub, HubConfig, Subscription};
use logtide_types::{LogEntry, LogFilter};

use crate::adapter::LogAdapter;
use crate::error::Result;

/// How long `stop` waits for the follow task to wind down
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A live, filtered tail of one unit, delivered through its own hub
///
/// The follow runs on a dedicated task and publishes into a single-subscriber
/// hub, so a consumer that stops draining is dropped like any other hub
/// subscriber instead of stalling the source. Failures arrive in-band as a
/// final ERROR record, after which the stream ends. Dropping the tail
/// cancels the follow and kills the source process.
#[derive(Debug)]
pub struct LiveTail {
    unit: String,

    /// Delivery channel for matching records
    subscription: Subscription<LogEntry>,

    /// Cancellation token for stopping the follow
    cancel: CancellationToken,

    /// Follow task handle
    task: JoinHandle<()>,
}

impl LiveTail {
    /// Start following `unit`; only the filter's `level` and `search` apply
    pub async fn start(
        adapter: LogAdapter,
        unit: &str,
        filter: &LogFilter,
        hub_config: HubConfig,
    ) -> Result<Self> {
        let hub = Hub::spawn(hub_config);
        let subscription = hub.register().await?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_follow(
            adapter,
            unit.to_string(),
            filter.for_follow(),
            hub,
            cancel.clone(),
        ));

        Ok(Self {
            unit: unit.to_string(),
            subscription,
            cancel,
            task,
        })
    }

    /// Wait for the next matching record; `None` once the tail has ended
    pub async fn recv(&mut self) -> Option<Arc<LogEntry>> {
        self.subscription.recv().await
    }

    /// Cancel and wait for the source process to be torn down
    ///
    /// Returns `false` if the task did not finish within the grace period;
    /// it is aborted, which still kills the source process on drop.
    pub async fn stop(mut self) -> bool {
        self.cancel.cancel();
        let stopped = join_or_abort(&mut self.task, STOP_GRACE).await;
        if !stopped {
            warn!(unit = %self.unit, "live tail did not stop in time, aborted");
        }
        stopped
    }
}

impl Drop for LiveTail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait up to `grace` for a task, aborting it if it is still running
async fn join_or_abort(task: &mut JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut *task).await.is_ok() {
        return true;
    }
    task.abort();
    false
}

async fn run_follow(
    adapter: LogAdapter,
    unit: String,
    filter: LogFilter,
    hub: Hub<LogEntry>,
    cancel: CancellationToken,
) {
    adapter
        .follow_in_band(
            &unit,
            &filter,
            move |entry| {
                hub.publish(entry);
            },
            cancel,
        )
        .await;
    // Last hub handle drops with the closure; the subscriber sees end of
    // stream after draining what was published
}
