//! Operator wrapping an async closure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::core::task::{Task, TaskError};

type TaskFn = dyn Fn() -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync;

/// Runs an in-process async function as a task.
///
/// ```rust
/// use tideflow::FnOperator;
///
/// let greet = FnOperator::new("greet", || async {
///     println!("hello from a closure");
///     Ok(())
/// });
/// ```
pub struct FnOperator {
    id: String,
    retries: u32,
    func: Arc<TaskFn>,
}

impl FnOperator {
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Arc::new(Self {
            id: id.into(),
            retries: 0,
            func: Arc::new(move || func().boxed()),
        })
    }

    /// Same as [`FnOperator::new`] with a retry budget.
    pub fn with_retries<F, Fut>(id: impl Into<String>, retries: u32, func: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Arc::new(Self {
            id: id.into(),
            retries,
            func: Arc::new(move || func().boxed()),
        })
    }
}

impl fmt::Debug for FnOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperator").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Task for FnOperator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self) -> Result<(), TaskError> {
        (self.func)().await
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn operator(&self) -> &'static str {
        "fn"
    }
}
