pub mod cron_scheduler;

pub use cron_scheduler::CronTriggerScheduler;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::models::CoreResult;

pub type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked once per fire, with no arguments.
pub type TriggerCallback = Arc<dyn Fn() -> TriggerFuture + Send + Sync>;

/// Capability for cancelling one recurring trigger registration.
///
/// Clones share the same registration. Cancelling is idempotent and takes
/// effect before the next fire.
#[derive(Clone, Debug)]
pub struct TriggerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl TriggerHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Meant for the single loop
    /// driving the registration.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.wake.notified().await;
        }
    }
}

pub trait TriggerScheduler: Send + Sync {
    /// Registers `callback` to fire on every occurrence of `cron_expr`.
    ///
    /// Fails with `TriggerRegistration` when the expression does not parse
    /// or the scheduler cannot host the registration.
    fn schedule(&self, cron_expr: &str, callback: TriggerCallback) -> CoreResult<TriggerHandle>;
}
