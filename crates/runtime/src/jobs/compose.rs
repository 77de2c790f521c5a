//! Compose job: run a command through `docker compose` as a subprocess.

use std::sync::Arc;

use async_trait::async_trait;

use super::{run_subprocess, split_command, Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::types::JobError;

const DEFAULT_COMPOSE_FILE: &str = "compose.yml";

pub struct ComposeJob {
    pub core: JobCore,
    /// Compose file path; defaults to `compose.yml`.
    pub file: Option<String>,
    /// Target service within the compose project.
    pub service: String,
    /// Use `exec` against the running service instead of `run --rm`.
    pub exec: bool,
}

impl ComposeJob {
    pub fn new(core: JobCore, service: impl Into<String>) -> Self {
        Self {
            core,
            file: None,
            service: service.into(),
            exec: false,
        }
    }

    /// Full argv passed to the `docker` binary.
    pub fn build_args(&self) -> Result<Vec<String>, JobError> {
        let file = self.file.as_deref().unwrap_or(DEFAULT_COMPOSE_FILE);
        let mut args = vec!["compose".to_string(), "-f".to_string(), file.to_string()];
        if self.exec {
            args.push("exec".to_string());
        } else {
            args.push("run".to_string());
            args.push("--rm".to_string());
        }
        args.push(self.service.clone());
        args.extend(split_command(self.command())?);
        Ok(args)
    }
}

#[async_trait]
impl Job for ComposeJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        self.validate()?;
        let args = self.build_args()?;
        run_subprocess(&ctx, "docker", &args, &[], None).await
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        hasher.push_opt_str("file", self.file.as_deref());
        hasher.push_str("service", &self.service);
        hasher.push_bool("exec", self.exec);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.service.trim().is_empty() {
            return Err(JobError::ServiceRequired);
        }
        split_command(self.command()).map(|_| ())
    }
}
