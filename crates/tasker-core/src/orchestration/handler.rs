use std::future::Future;
use std::pin::Pin;

use crate::models::CoreResult;
use crate::orchestration::TaskContext;

pub type HandlerFuture = Pin<Box<dyn Future<Output = CoreResult<()>> + Send>>;

/// Domain logic invoked once per execution.
///
/// Returning `Err` without calling `TaskContext::fail` still fails the
/// execution; returning `Ok` without calling `success` completes it.
pub trait TaskHandler: Send + Sync {
    fn call(&self, context: TaskContext) -> HandlerFuture;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = CoreResult<()>> + Send + 'static,
{
    fn call(&self, context: TaskContext) -> HandlerFuture {
        Box::pin(self(context))
    }
}
