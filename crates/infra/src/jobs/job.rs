//! A single submission moving through upload, poll and finalize.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use notary_core::{FinalizeResult, InfoResult, InfoStatus, JobOptions, Status, UploadResult};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::adapter::StageError;

const UPLOAD_ERROR: &str = "Error happened while uploading file to the signing service";
const UPLOAD_ISSUE: &str = "Issue happened while uploading file to the signing service";
const UPLOADED: &str = "File has been successfully uploaded to the signing service";
const POLL_ERROR: &str = "Error happened while retrieving signing status";
const SIGNED: &str = "Signing has successfully completed on the signing service";
const SIGNING_FAILED: &str = "Signing has failed on the signing service";
const STATUS_UNAVAILABLE: &str = "Signing service fails to report progress";
const TOO_LONG: &str = "Signing service reports the submission in progress for too long";
const FINALIZE_ERROR: &str =
    "Error happened while finalizing the uploaded file. Signing has been successful though";
const FINALIZED: &str = "File has been finalized successfully. You can now download it";
const CANCELLED: &str = "Submission was cancelled before completion";
const INTERNAL: &str = "Internal error while processing the submission";

/// Handed to every stage; stages must stop promptly once `cancel` fires.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub cancel: CancellationToken,
    pub file: PathBuf,
}

pub type StageFuture<T> = BoxFuture<'static, Result<T, StageError>>;
type UploadStage = Box<dyn FnOnce(StageContext) -> StageFuture<UploadResult> + Send>;
type PollStage = Box<dyn FnOnce(StageContext, UploadResult) -> StageFuture<InfoResult> + Send>;
type FinalizeStage =
    Box<dyn FnOnce(StageContext, InfoResult) -> StageFuture<FinalizeResult> + Send>;

/// The work a job performs. Each stage already carries its own retry policy.
pub struct Stages {
    upload: UploadStage,
    poll: PollStage,
    finalize: Option<FinalizeStage>,
}

impl Stages {
    pub fn new<U, UF, P, PF>(upload: U, poll: P) -> Self
    where
        U: FnOnce(StageContext) -> UF + Send + 'static,
        UF: Future<Output = Result<UploadResult, StageError>> + Send + 'static,
        P: FnOnce(StageContext, UploadResult) -> PF + Send + 'static,
        PF: Future<Output = Result<InfoResult, StageError>> + Send + 'static,
    {
        Self {
            upload: Box::new(move |ctx| upload(ctx).boxed()),
            poll: Box::new(move |ctx, uploaded| poll(ctx, uploaded).boxed()),
            finalize: None,
        }
    }

    /// Run `finalize` after a successful poll.
    pub fn with_finalize<F, FF>(mut self, finalize: F) -> Self
    where
        F: FnOnce(StageContext, InfoResult) -> FF + Send + 'static,
        FF: Future<Output = Result<FinalizeResult, StageError>> + Send + 'static,
    {
        self.finalize = Some(Box::new(move |ctx, info| finalize(ctx, info).boxed()));
        self
    }

    pub fn has_finalize(&self) -> bool {
        self.finalize.is_some()
    }
}

impl fmt::Debug for Stages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stages")
            .field("finalize", &self.finalize.is_some())
            .finish_non_exhaustive()
    }
}

/// A submission in flight.
///
/// The status only moves forward: once COMPLETE or ERROR it never changes.
/// A background task drives the stages and is the only writer of the status.
pub struct Job {
    file: PathBuf,
    filename: Option<String>,
    options: JobOptions,
    status: watch::Sender<Status>,
    cancel: CancellationToken,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("file", &self.file)
            .field("filename", &self.filename)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Create the job and start its stages on `runtime` right away.
    pub fn spawn(
        file: PathBuf,
        filename: Option<String>,
        options: JobOptions,
        stages: Stages,
        runtime: &RuntimeHandle,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(Status::initial());
        let job = Arc::new(Self {
            file,
            filename,
            options,
            status,
            cancel: CancellationToken::new(),
        });

        let span = info_span!("job", file = %job.file.display());
        runtime.spawn(drive(Arc::clone(&job), stages).instrument(span));
        job
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Name the payload was submitted under, if the caller gave one.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Current status snapshot.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Ask the job to stop. Running stages see the cancellation and return;
    /// the job ends in ERROR unless it had already finished.
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        debug!(file = %self.file.display(), "cancelling job");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the job reaches a terminal status, at most `timeout`.
    pub async fn await_result(&self, timeout: Duration) -> Option<Status> {
        let mut rx = self.status.subscribe();
        let wait = async move {
            rx.wait_for(Status::is_terminal)
                .await
                .map(|status| status.clone())
                .ok()
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Publish `next` unless the current status forbids it. A `next` without
    /// a log inherits the current one.
    fn transition(&self, next: Status) -> bool {
        self.status.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                return false;
            }
            let inherited = current.log.take();
            *current = next;
            if current.log.is_none() {
                current.log = inherited;
            }
            true
        })
    }

    fn fail(&self, message: &str, detail: impl Into<String>) {
        self.transition(Status::error(message).with_more_info(detail));
    }

    /// Shared handling for every stage outcome: a cancelled job always ends as
    /// cancelled, whatever the stage managed to return.
    fn settle<T>(&self, outcome: Result<T, StageError>, error_message: &str) -> Option<T> {
        if self.is_cancelled() {
            self.transition(Status::error(CANCELLED));
            return None;
        }
        match outcome {
            Ok(value) => Some(value),
            Err(StageError::Cancelled) => {
                self.transition(Status::error(CANCELLED));
                None
            }
            Err(err) => {
                warn!(error = %err, "{error_message}");
                self.fail(error_message, err.to_string());
                None
            }
        }
    }

    fn on_upload(&self, outcome: Result<UploadResult, StageError>) -> Option<UploadResult> {
        let uploaded = self.settle(outcome, UPLOAD_ERROR)?;
        if uploaded.is_failed() {
            warn!(message = %uploaded.message, "upload failed");
            self.fail(UPLOAD_ISSUE, uploaded.message);
            return None;
        }
        if uploaded.correlation_id.is_none() {
            error!("upload reported success without a correlation id");
            self.fail(INTERNAL, "upload reported success without a correlation id");
            return None;
        }
        info!(correlation_id = uploaded.correlation_id.as_deref(), "file uploaded");
        self.transition(Status::in_progress(UPLOADED).with_more_info(uploaded.message.clone()));
        Some(uploaded)
    }

    fn on_poll(
        &self,
        outcome: Result<InfoResult, StageError>,
        finalize_next: bool,
    ) -> Option<InfoResult> {
        let info = self.settle(outcome, POLL_ERROR)?;
        let log = info.log.clone();
        let failure = match info.status {
            InfoStatus::Successful => None,
            InfoStatus::Failed => Some(SIGNING_FAILED),
            InfoStatus::RetrievalFailed => Some(STATUS_UNAVAILABLE),
            InfoStatus::InProgress => Some(TOO_LONG),
        };
        if let Some(message) = failure {
            warn!(status = ?info.status, message = %info.message, "signing did not succeed");
            self.transition(
                Status::error(message)
                    .with_more_info(info.message)
                    .with_log(log),
            );
            return None;
        }

        info!("signing succeeded");
        let next = if finalize_next {
            Status::in_progress(SIGNED)
        } else {
            Status::complete(SIGNED)
        };
        self.transition(next.with_more_info(info.message.clone()).with_log(log));
        Some(info)
    }

    fn on_finalize(&self, outcome: Result<FinalizeResult, StageError>) {
        let Some(finalized) = self.settle(outcome, FINALIZE_ERROR) else {
            return;
        };
        if finalized.is_error() {
            warn!(message = %finalized.message, "finalize failed");
            self.fail(FINALIZE_ERROR, finalized.message);
            return;
        }
        info!("file finalized");
        self.transition(Status::complete(FINALIZED).with_more_info(finalized.message));
    }

    fn context(&self) -> StageContext {
        StageContext {
            cancel: self.cancel.clone(),
            file: self.file.clone(),
        }
    }
}

async fn run_stages(job: &Job, stages: Stages) {
    let Stages {
        upload,
        poll,
        finalize,
    } = stages;

    debug!("upload stage starting");
    let Some(uploaded) = job.on_upload(upload(job.context()).await) else {
        return;
    };

    debug!("poll stage starting");
    let Some(info) = job.on_poll(poll(job.context(), uploaded).await, finalize.is_some()) else {
        return;
    };

    if let Some(finalize) = finalize {
        debug!("finalize stage starting");
        job.on_finalize(finalize(job.context(), info).await);
    }
}

async fn drive(job: Arc<Job>, stages: Stages) {
    let outcome = AssertUnwindSafe(run_stages(&job, stages)).catch_unwind().await;
    if let Err(panic) = outcome {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "stage panicked".to_string());
        error!(panic = %detail, "stage panicked");
        job.fail(INTERNAL, detail);
    }

    // Every path above ends in a terminal status; this only guards against a
    // stage chain that returned early without publishing one.
    if !job.is_done() {
        if job.is_cancelled() {
            job.transition(Status::error(CANCELLED));
        } else {
            job.fail(INTERNAL, "stages ended without a final status");
        }
    }

    let status = job.status();
    debug!(state = %status.state, message = %status.message, "job finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use notary_core::State;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn(stages: Stages) -> Arc<Job> {
        Job::spawn(
            PathBuf::from("/tmp/payload.zip"),
            Some("payload.zip".into()),
            JobOptions::new(),
            stages,
            &RuntimeHandle::current(),
        )
    }

    fn uploaded() -> Result<UploadResult, StageError> {
        Ok(UploadResult::successful("id-1", "uploaded"))
    }

    #[tokio::test]
    async fn happy_path_without_finalize_completes() {
        let job = spawn(Stages::new(
            |_| async { uploaded() },
            |_, up: UploadResult| async move {
                assert_eq!(up.correlation_id.as_deref(), Some("id-1"));
                Ok(InfoResult::successful("accepted").with_log("all good"))
            },
        ));

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Complete);
        assert_eq!(status.message, SIGNED);
        assert_eq!(status.log.as_deref(), Some("all good"));
    }

    #[tokio::test]
    async fn finalize_runs_after_poll_and_keeps_log() {
        let job = spawn(
            Stages::new(
                |_| async { uploaded() },
                |_, _| async { Ok(InfoResult::successful("accepted").with_log("remote log")) },
            )
            .with_finalize(|ctx: StageContext, info: InfoResult| async move {
                assert_eq!(ctx.file, PathBuf::from("/tmp/payload.zip"));
                assert_eq!(info.log.as_deref(), Some("remote log"));
                Ok(FinalizeResult::success("stapled"))
            }),
        );

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Complete);
        assert_eq!(status.message, FINALIZED);
        assert_eq!(status.more_info.as_deref(), Some("stapled"));
        assert_eq!(status.log.as_deref(), Some("remote log"));
    }

    #[tokio::test]
    async fn failed_upload_skips_later_stages() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&polls);
        let job = spawn(Stages::new(
            |_| async { Ok(UploadResult::failed("rejected by service")) },
            move |_, _| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(InfoResult::successful("unreachable"))
            },
        ));

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.message, UPLOAD_ISSUE);
        assert_eq!(status.more_info.as_deref(), Some("rejected by service"));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_error_is_reported_with_detail() {
        let job = spawn(Stages::new(
            |_| async { Err(StageError::Parse("garbage".into())) },
            |_, _| async { Ok(InfoResult::successful("unreachable")) },
        ));

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.message, UPLOAD_ERROR);
        assert!(status.more_info.unwrap().contains("garbage"));
    }

    #[tokio::test]
    async fn poll_outcomes_map_to_error_messages() {
        let cases = [
            (InfoResult::failed("invalid signature").with_log("details"), SIGNING_FAILED),
            (InfoResult::retrieval_failed("503"), STATUS_UNAVAILABLE),
            (InfoResult::in_progress("still going"), TOO_LONG),
        ];
        for (info, expected) in cases {
            let job = spawn(Stages::new(
                |_| async { uploaded() },
                move |_, _| async move { Ok(info) },
            ));
            let status = job.await_result(WAIT).await.unwrap();
            assert_eq!(status.state, State::Error);
            assert_eq!(status.message, expected);
        }
    }

    #[tokio::test]
    async fn finalize_failure_preserves_poll_log() {
        let job = spawn(
            Stages::new(
                |_| async { uploaded() },
                |_, _| async { Ok(InfoResult::successful("ok").with_log("remote log")) },
            )
            .with_finalize(|_, _| async { Ok(FinalizeResult::error("staple failed")) }),
        );

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.message, FINALIZE_ERROR);
        assert_eq!(status.more_info.as_deref(), Some("staple failed"));
        assert_eq!(status.log.as_deref(), Some("remote log"));
    }

    #[tokio::test]
    async fn panicking_stage_ends_in_error() {
        let job = spawn(Stages::new(
            |_| async { uploaded() },
            |_, _| async { panic!("adapter exploded") },
        ));

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.message, INTERNAL);
        assert_eq!(status.more_info.as_deref(), Some("adapter exploded"));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_stage() {
        let job = spawn(Stages::new(
            |_| async { uploaded() },
            |ctx: StageContext, _| async move {
                ctx.cancel.cancelled().await;
                Err(StageError::Cancelled)
            },
        ));

        // Wait for the upload transition so the poll stage is running.
        let mut rx = job.status.subscribe();
        rx.wait_for(|s| s.message == UPLOADED).await.unwrap();
        job.cancel();

        let status = job.await_result(WAIT).await.unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.message, CANCELLED);
    }

    #[tokio::test]
    async fn cancel_after_completion_changes_nothing() {
        let job = spawn(Stages::new(
            |_| async { uploaded() },
            |_, _| async { Ok(InfoResult::successful("ok")) },
        ));
        let done = job.await_result(WAIT).await.unwrap();

        job.cancel();
        assert!(!job.is_cancelled());
        assert_eq!(job.status(), done);
    }

    #[tokio::test]
    async fn terminal_status_rejects_further_transitions() {
        let job = spawn(Stages::new(
            |_| async { uploaded() },
            |_, _| async { Ok(InfoResult::successful("ok")) },
        ));
        let done = job.await_result(WAIT).await.unwrap();

        assert!(!job.transition(Status::error("late")));
        assert!(!job.transition(Status::in_progress("again")));
        assert_eq!(job.status(), done);
    }

    #[tokio::test]
    async fn await_result_times_out_while_running() {
        let job = spawn(Stages::new(
            |ctx: StageContext| async move {
                ctx.cancel.cancelled().await;
                Err(StageError::Cancelled)
            },
            |_, _| async { Ok(InfoResult::successful("ok")) },
        ));

        assert!(job.await_result(Duration::from_millis(50)).await.is_none());
        assert_eq!(job.status().state, State::InProgress);
        job.cancel();
        assert_eq!(job.await_result(WAIT).await.unwrap().message, CANCELLED);
    }
}
