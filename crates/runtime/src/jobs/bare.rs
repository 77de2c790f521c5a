//! Bare job: a schedulable unit with an injectable action and no runtime
//! beyond the scheduler itself. The building block for embedders that want
//! cron dispatch over arbitrary async work.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::types::JobError;

pub type BareAction =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

pub struct BareJob {
    pub core: JobCore,
    action: Option<BareAction>,
}

impl BareJob {
    pub fn new(core: JobCore) -> Self {
        Self { core, action: None }
    }

    pub fn with_action<F>(core: JobCore, action: F) -> Self
    where
        F: Fn(Arc<Context>) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static,
    {
        Self {
            core,
            action: Some(Arc::new(action)),
        }
    }
}

#[async_trait]
impl Job for BareJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        match &self.action {
            Some(action) => action(ctx).await,
            None => Ok(()),
        }
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        Ok(())
    }
}
