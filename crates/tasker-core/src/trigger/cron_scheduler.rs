use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::runtime::Handle;

use crate::models::{CoreError, CoreErrorKind, CoreResult};
use crate::trigger::{TriggerCallback, TriggerHandle, TriggerScheduler};

/// Runs each registration as its own tokio task that sleeps until the next
/// occurrence of a six-field (seconds first) cron expression.
#[derive(Default)]
pub struct CronTriggerScheduler {
    next_id: AtomicU64,
}

impl CronTriggerScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TriggerScheduler for CronTriggerScheduler {
    fn schedule(&self, cron_expr: &str, callback: TriggerCallback) -> CoreResult<TriggerHandle> {
        let schedule = Schedule::from_str(cron_expr).map_err(|error| {
            CoreError::new(
                CoreErrorKind::TriggerRegistration,
                format!("invalid cron expression '{cron_expr}': {error}"),
            )
        })?;
        let runtime = Handle::try_current().map_err(|error| {
            CoreError::new(
                CoreErrorKind::TriggerRegistration,
                format!("cron triggers require a tokio runtime: {error}"),
            )
        })?;

        let handle = TriggerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        runtime.spawn(drive_trigger(
            schedule,
            cron_expr.to_string(),
            callback,
            handle.clone(),
        ));

        tracing::debug!(trigger_id = handle.id(), cron = cron_expr, "registered cron trigger");
        Ok(handle)
    }
}

async fn drive_trigger(
    schedule: Schedule,
    cron_expr: String,
    callback: TriggerCallback,
    handle: TriggerHandle,
) {
    let mut after = Utc::now();

    loop {
        if handle.is_cancelled() {
            break;
        }

        let Some(next) = schedule.after(&after).next() else {
            tracing::debug!(
                trigger_id = handle.id(),
                cron = %cron_expr,
                "cron trigger has no upcoming occurrence"
            );
            break;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = handle.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if handle.is_cancelled() {
            break;
        }

        tokio::spawn(callback());
        // A late wake-up skips missed occurrences instead of replaying them.
        after = next.max(Utc::now());
    }

    tracing::debug!(trigger_id = handle.id(), cron = %cron_expr, "cron trigger stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::trigger::TriggerFuture;

    fn counting_callback(counter: Arc<AtomicUsize>) -> TriggerCallback {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as TriggerFuture
        })
    }

    #[tokio::test]
    async fn invalid_expression_is_rejected() {
        let scheduler = CronTriggerScheduler::new();
        let error = scheduler
            .schedule("not a cron", counting_callback(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::TriggerRegistration);
    }

    #[test]
    fn registration_outside_runtime_is_rejected() {
        let scheduler = CronTriggerScheduler::new();
        let error = scheduler
            .schedule("* * * * * *", counting_callback(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::TriggerRegistration);
    }

    #[tokio::test]
    async fn every_second_trigger_fires_until_cancelled() {
        let scheduler = CronTriggerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler
            .schedule("* * * * * *", counting_callback(fired.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_cancel = fired.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn handles_receive_distinct_ids() {
        let scheduler = CronTriggerScheduler::new();
        let first = scheduler
            .schedule("0 0 * * * *", counting_callback(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let second = scheduler
            .schedule("0 0 * * * *", counting_callback(Arc::new(AtomicUsize::new(0))))
            .unwrap();

        assert_ne!(first.id(), second.id());
        first.cancel();
        second.cancel();
        assert!(first.is_cancelled());
    }
}
