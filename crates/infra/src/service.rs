//! The boundary used by transport layers: submit a payload, query its status,
//! fetch the processed artifact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notary_core::{
    DomainError, FinalizeResult, Handle, InfoResult, JobOptions, State, StatusWithHandle,
    UploadResult,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::runtime::Handle as RuntimeHandle;
use tracing::{debug, info, warn};

use crate::adapter::{FinalizeRequest, PollRequest, StageError, ToolAdapter, UploadRequest};
use crate::config::EngineConfig;
use crate::jobs::{Job, Registry, Retry, StageContext, Stages};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("no submission with handle {0}")]
    NotFound(Handle),

    #[error("submission {handle} is not complete (status {state})")]
    NotReady { handle: Handle, state: State },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// A completed submission's payload, opened for reading.
#[derive(Debug)]
pub struct Artifact {
    pub file: tokio::fs::File,
    pub path: PathBuf,
    /// Name the payload was submitted under.
    pub filename: Option<String>,
}

impl Artifact {
    /// Name to hand back to the caller: the submitted one, else the stored one.
    pub fn download_name(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".to_string())
        })
    }
}

/// Accepts submissions and runs them through `adapter`.
pub struct SubmissionService<A> {
    config: EngineConfig,
    adapter: Arc<A>,
    registry: Registry,
    runtime: RuntimeHandle,
}

impl<A> std::fmt::Debug for SubmissionService<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionService")
            .field("pending_dir", &self.config.pending_dir)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<A> SubmissionService<A>
where
    A: ToolAdapter,
{
    pub fn new(config: EngineConfig, adapter: A, runtime: RuntimeHandle) -> Self {
        let registry = Registry::new(&config.registry, &runtime);
        Self {
            config,
            adapter: Arc::new(adapter),
            registry,
            runtime,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Make sure the pending directory exists and holds nothing left over
    /// from a previous run.
    pub async fn prepare(&self) -> Result<(), ServiceError> {
        let dir = &self.config.pending_dir;
        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {
                info!(dir = %dir.display(), "cleaning pending directory");
                tokio::fs::remove_dir_all(dir).await?;
            }
            Ok(_) => {
                return Err(std::io::Error::other(format!(
                    "{} exists and is not a directory",
                    dir.display()
                ))
                .into());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(dir).await?;
        info!(dir = %dir.display(), "pending directory ready");
        Ok(())
    }

    /// Store `body` and start processing it. Returns once the payload is on
    /// disk; copy failures are reported here, not through the job.
    pub async fn submit<R>(
        &self,
        body: R,
        filename: Option<&str>,
        options: JobOptions,
    ) -> Result<StatusWithHandle, ServiceError>
    where
        R: AsyncRead + Unpin,
    {
        let file = self.store_payload(body, filename).await?;
        let stages = self.stages_for(&file, &options);
        let job = Job::spawn(
            file,
            filename.map(str::to_string),
            options,
            stages,
            &self.runtime,
        );
        let handle = self.registry.put(Arc::clone(&job));

        info!(
            %handle,
            file = %job.file().display(),
            finalize = job.options().finalize,
            "submission accepted"
        );
        Ok(StatusWithHandle::new(handle, job.status()))
    }

    pub fn query_status(&self, handle: Handle) -> Result<StatusWithHandle, ServiceError> {
        self.registry
            .get(handle)
            .map(|job| StatusWithHandle::new(handle, job.status()))
            .ok_or(ServiceError::NotFound(handle))
    }

    /// Open the processed payload. Only available once the job is COMPLETE.
    pub async fn fetch_artifact(&self, handle: Handle) -> Result<Artifact, ServiceError> {
        let job = self
            .registry
            .get(handle)
            .ok_or(ServiceError::NotFound(handle))?;

        let state = job.status().state;
        if state != State::Complete {
            return Err(ServiceError::NotReady { handle, state });
        }

        let path = job.file().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        Ok(Artifact {
            file,
            path,
            filename: job.filename().map(str::to_string),
        })
    }

    async fn store_payload<R>(&self, mut body: R, filename: Option<&str>) -> Result<PathBuf, ServiceError>
    where
        R: AsyncRead + Unpin,
    {
        let dir = &self.config.pending_dir;
        tokio::fs::create_dir_all(dir).await?;

        let (prefix, suffix) = temp_name_parts(filename);
        let (file, path) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| e.error)?;

        let mut out = tokio::fs::File::from_std(file);
        let copied = async {
            let bytes = tokio::io::copy(&mut body, &mut out).await?;
            out.flush().await?;
            Ok::<_, std::io::Error>(bytes)
        }
        .await;

        match copied {
            Ok(bytes) => {
                debug!(path = %path.display(), bytes, "payload stored");
                Ok(path)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %cleanup, "failed to delete partial payload");
                }
                Err(e.into())
            }
        }
    }

    fn stages_for(&self, file: &Path, options: &JobOptions) -> Stages {
        let upload = {
            let adapter = Arc::clone(&self.adapter);
            let policy = self.config.upload.retry_policy();
            let request = UploadRequest {
                file: file.to_path_buf(),
                options: options.clone(),
                timeout: self.config.upload.timeout,
            };
            move |ctx: StageContext| async move {
                let retry = Retry::new("upload", policy)
                    .retry_if_result(UploadResult::is_failed)
                    .retry_if_error(StageError::is_transient)
                    .cancel_on(ctx.cancel.clone());
                let (adapter, request, cancel) = (&adapter, &request, &ctx.cancel);
                retry.execute(move || adapter.submit(request, cancel)).await
            }
        };

        let poll = {
            let adapter = Arc::clone(&self.adapter);
            let cfg = self.config.poll.clone();
            let options = options.clone();
            move |ctx: StageContext, uploaded: UploadResult| async move {
                let correlation_id = uploaded.correlation_id.ok_or_else(|| {
                    StageError::Internal("upload produced no correlation id".into())
                })?;
                let request = PollRequest {
                    correlation_id,
                    options,
                    timeout: cfg.attempt_timeout,
                };

                // Keep polling while the service reports progress; each poll
                // tolerates the service being unreachable for a while.
                let progress = Retry::new("poll", cfg.progress_policy())
                    .retry_if_result(InfoResult::is_in_progress)
                    .cancel_on(ctx.cancel.clone());
                let attempt = Retry::new("poll-attempt", cfg.failure_policy())
                    .retry_if_result(InfoResult::is_retrieval_failure)
                    .retry_if_error(StageError::is_transient)
                    .cancel_on(ctx.cancel.clone());

                let (adapter, request, cancel) = (&adapter, &request, &ctx.cancel);
                progress
                    .execute_nested(&attempt, move || adapter.poll_once(request, cancel))
                    .await
            }
        };

        let stages = Stages::new(upload, poll);
        if !options.finalize {
            return stages;
        }

        let adapter = Arc::clone(&self.adapter);
        let policy = self.config.finalize.retry_policy();
        let request = FinalizeRequest {
            file: file.to_path_buf(),
            options: options.clone(),
            timeout: self.config.finalize.timeout,
        };
        stages.with_finalize(move |ctx: StageContext, _info: InfoResult| async move {
            let retry = Retry::new("finalize", policy)
                .retry_if_result(FinalizeResult::is_error)
                .retry_if_error(StageError::is_transient)
                .cancel_on(ctx.cancel.clone());
            let (adapter, request, cancel) = (&adapter, &request, &ctx.cancel);
            retry.execute(move || adapter.finalize(request, cancel)).await
        })
    }
}

/// Split a caller-supplied name into a temp file prefix and suffix, keeping
/// only its last path component: `../a/app.zip` becomes `app-` and `.zip`.
fn temp_name_parts(filename: Option<&str>) -> (String, String) {
    let name = filename
        .and_then(|n| Path::new(n).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.trim().is_empty());

    let Some(name) = name else {
        return ("unknown-".to_string(), String::new());
    };
    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (format!("{stem}-"), suffix)
}
