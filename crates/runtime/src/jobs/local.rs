//! Local subprocess job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{run_subprocess, split_command, Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::types::JobError;

/// Runs the command as a subprocess on the host, with the scheduler's
/// environment plus job-supplied variables.
pub struct LocalJob {
    pub core: JobCore,
    /// Extra `KEY=VALUE` pairs layered over the inherited environment.
    pub env: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LocalJob {
    pub fn new(core: JobCore) -> Self {
        Self {
            core,
            env: Vec::new(),
            working_dir: None,
        }
    }
}

/// Resolve `program` the way a shell would: verbatim when it carries a path
/// separator, otherwise the first match on `PATH`.
pub fn lookup_path(program: &str) -> Result<PathBuf, JobError> {
    let not_found = || JobError::CommandNotFound {
        command: program.to_string(),
    };

    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(program);
        return if is_executable(path) {
            Ok(path.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let path_var = std::env::var_os("PATH").ok_or_else(not_found)?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(not_found())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl Job for LocalJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        let argv = split_command(self.command())?;
        let program = lookup_path(&argv[0])?;

        run_subprocess(
            &ctx,
            &program,
            &argv[1..],
            &self.env,
            self.working_dir.as_deref(),
        )
        .await
        .map_err(|err| match err {
            JobError::NonZeroExit { .. }
            | JobError::Canceled
            | JobError::Unexpected(_)
            | JobError::LocalRun(_) => err,
            other => JobError::LocalRun(other.to_string()),
        })
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        hasher.push_str_slice("env", &self.env);
        hasher.push_opt_str(
            "working_dir",
            self.working_dir.as_ref().and_then(|d| d.to_str()),
        );
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        split_command(self.command()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::test_support::test_context;

    fn local(command: &str) -> Arc<LocalJob> {
        Arc::new(LocalJob::new(JobCore::new("local", "@daily", command)))
    }

    #[tokio::test]
    async fn captures_stdout_of_a_successful_run() {
        let job = local("echo hello-from-local");
        let ctx = test_context(job.clone());
        job.run(ctx.clone()).await.unwrap();
        assert!(ctx
            .execution
            .output()
            .to_string_lossy()
            .contains("hello-from-local"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_preserved_verbatim() {
        let job = local("sh -c 'exit 7'");
        let ctx = test_context(job.clone());
        let err = job.run(ctx).await.unwrap_err();
        assert!(matches!(err, JobError::NonZeroExit { code: 7 }));
    }

    #[tokio::test]
    async fn stderr_goes_to_the_error_stream() {
        let job = local("sh -c 'echo oops >&2'");
        let ctx = test_context(job.clone());
        job.run(ctx.clone()).await.unwrap();
        assert!(ctx
            .execution
            .error_output()
            .to_string_lossy()
            .contains("oops"));
        assert!(ctx.execution.output().is_empty());
    }

    #[tokio::test]
    async fn empty_command_fails_validation_and_run() {
        let job = local("");
        assert!(matches!(job.validate(), Err(JobError::EmptyCommand)));
        let ctx = test_context(job.clone());
        assert!(matches!(job.run(ctx).await, Err(JobError::EmptyCommand)));
    }

    #[tokio::test]
    async fn unknown_program_is_command_not_found() {
        let job = local("definitely-not-a-real-binary-4a7f");
        let ctx = test_context(job.clone());
        let err = job.run(ctx).await.unwrap_err();
        assert!(matches!(err, JobError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn job_env_is_visible_to_the_subprocess() {
        let mut job = LocalJob::new(JobCore::new("local", "@daily", "sh -c 'echo $EXTRA_VAR'"));
        job.env.push("EXTRA_VAR=injected-value".to_string());
        let job = Arc::new(job);
        let ctx = test_context(job.clone());
        job.run(ctx.clone()).await.unwrap();
        assert!(ctx
            .execution
            .output()
            .to_string_lossy()
            .contains("injected-value"));
    }

    #[tokio::test]
    async fn working_dir_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalJob::new(JobCore::new("local", "@daily", "pwd"));
        job.working_dir = Some(dir.path().to_path_buf());
        let job = Arc::new(job);
        let ctx = test_context(job.clone());
        job.run(ctx.clone()).await.unwrap();
        let out = ctx.execution.output().to_string_lossy();
        assert!(out.trim_end().ends_with(
            dir.path()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        ));
    }

    #[test]
    fn hash_changes_with_env() {
        let a = local("echo x");
        let mut b = LocalJob::new(JobCore::new("local", "@daily", "echo x"));
        b.env.push("A=1".to_string());
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn lookup_path_finds_sh() {
        assert!(lookup_path("sh").is_ok());
        assert!(lookup_path("no-such-binary-9bd2").is_err());
    }
}
