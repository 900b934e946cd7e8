use std::path::Path;

use async_trait::async_trait;
use notary_core::{FinalizeResult, InfoResult, JobOptions, UploadResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FinalizeRequest, PollRequest, StageError, ToolAdapter, UploadRequest};
use crate::process::{ProcessOutput, ProcessRunner, ProcessSpec};

const ALREADY_UPLOADED: &str = "already-uploaded";
const STATUS_IN_PROGRESS: &str = "in-progress";
const STATUS_SUCCESS: &str = "success";
const STATUS_FAILED: &str = "failed";

/// A program plus arguments that may contain placeholders:
///
/// * `{file}`: path of the submitted payload
/// * `{id}`: correlation id returned by the upload
/// * `{param.NAME}`: the job option `NAME`
///
/// Anything else between braces is passed through untouched, so shell
/// snippets like `${HOME}` keep working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line on whitespace. No quoting rules apply.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = words.next()?;
        Some(Self::new(program, words))
    }

    fn render(&self, vars: &Placeholders<'_>) -> Result<ProcessSpec, StageError> {
        let args = self
            .args
            .iter()
            .map(|arg| render_arg(arg, vars))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProcessSpec::new(self.program.clone()).args(args))
    }
}

struct Placeholders<'a> {
    file: Option<&'a Path>,
    id: Option<&'a str>,
    options: &'a JobOptions,
}

impl Placeholders<'_> {
    /// `Ok(None)` means "not ours, leave the braces alone".
    fn resolve(&self, key: &str) -> Result<Option<String>, StageError> {
        match key {
            "file" => self
                .file
                .map(|p| Some(p.to_string_lossy().into_owned()))
                .ok_or_else(|| StageError::Internal("{file} is not available here".into())),
            "id" => self
                .id
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| StageError::Internal("{id} is not available here".into())),
            _ => match key.strip_prefix("param.") {
                Some(name) => self
                    .options
                    .param(name)
                    .map(|v| Some(v.to_string()))
                    .ok_or_else(|| StageError::Internal(format!("missing job parameter `{name}`"))),
                None => Ok(None),
            },
        }
    }
}

fn render_arg(arg: &str, vars: &Placeholders<'_>) -> Result<String, StageError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = &after[..end];
        match vars.resolve(key)? {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Drives the remote service through command line tools.
///
/// Output contract:
///
/// * upload prints the correlation id on its last stdout line, or
///   `already-uploaded <id>` when the service already has the payload; a
///   non-zero exit is a failed upload
/// * status prints `in-progress`, `success` or `failed` on its first stdout
///   line, followed by an optional log; a non-zero exit means the status
///   could not be retrieved
/// * finalize exits with 0 on success
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    upload: CommandTemplate,
    poll: CommandTemplate,
    finalize: Option<CommandTemplate>,
    env: Vec<(String, String)>,
    runner: ProcessRunner,
}

impl CommandAdapter {
    pub fn new(upload: CommandTemplate, poll: CommandTemplate, runner: ProcessRunner) -> Self {
        Self {
            upload,
            poll,
            finalize: None,
            env: Vec::new(),
            runner,
        }
    }

    pub fn with_finalize(mut self, finalize: CommandTemplate) -> Self {
        self.finalize = Some(finalize);
        self
    }

    /// Environment for every command. Credentials belong here rather than in
    /// arguments, which show up in logs.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn spec(
        &self,
        template: &CommandTemplate,
        vars: &Placeholders<'_>,
        scratch_prefix: String,
    ) -> Result<ProcessSpec, StageError> {
        let spec = self
            .env
            .iter()
            .fold(template.render(vars)?, |spec, (k, v)| spec.env(k.clone(), v.clone()));
        Ok(spec.scratch_dir(scratch_prefix))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string())
}

async fn read_stdout(output: &ProcessOutput) -> Result<String, StageError> {
    output
        .stdout_string()
        .await
        .map_err(|e| StageError::Io(format!("reading output of `{}`: {e}", output.command())))
}

/// The last few non-empty lines of stderr, or of stdout when stderr is silent.
async fn failure_detail(output: &ProcessOutput) -> String {
    const LINES: usize = 5;
    let stderr = output.stderr_string().await.unwrap_or_default();
    let source = if stderr.trim().is_empty() {
        output.stdout_string().await.unwrap_or_default()
    } else {
        stderr
    };
    let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = &lines[lines.len().saturating_sub(LINES)..];
    format!("exit code {}: {}", output.exit_code(), tail.join("\n"))
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    async fn submit(
        &self,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StageError> {
        let vars = Placeholders {
            file: Some(&request.file),
            id: None,
            options: &request.options,
        };
        let spec = self.spec(&self.upload, &vars, format!("{}-upload-", file_stem(&request.file)))?;
        let output = self.runner.run(&spec, request.timeout, cancel).await?;

        if !output.success() {
            return Ok(UploadResult::failed(format!(
                "Upload command failed ({})",
                failure_detail(&output).await
            )));
        }

        let stdout = read_stdout(&output).await?;
        let Some(last) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() else {
            return Err(StageError::Parse(
                "upload command succeeded but printed no correlation id".into(),
            ));
        };

        let (keyword, rest) = last.split_once(char::is_whitespace).unwrap_or((last, ""));
        if keyword == ALREADY_UPLOADED {
            let id = rest.trim();
            if id.is_empty() {
                return Err(StageError::Parse(format!(
                    "`{ALREADY_UPLOADED}` reported without a correlation id"
                )));
            }
            debug!(correlation_id = id, "payload was already known to the remote service");
            return Ok(UploadResult::already_uploaded(id));
        }

        Ok(UploadResult::successful(
            last,
            format!("Signing in progress (correlation id {last})"),
        ))
    }

    async fn poll_once(
        &self,
        request: &PollRequest,
        cancel: &CancellationToken,
    ) -> Result<InfoResult, StageError> {
        let vars = Placeholders {
            file: None,
            id: Some(&request.correlation_id),
            options: &request.options,
        };
        let spec = self.spec(&self.poll, &vars, "status-".to_string())?;
        let output = self.runner.run(&spec, request.timeout, cancel).await?;

        if !output.success() {
            return Ok(InfoResult::retrieval_failed(format!(
                "Status command failed ({})",
                failure_detail(&output).await
            )));
        }

        let stdout = read_stdout(&output).await?;
        let mut lines = stdout.lines();
        let first = lines.by_ref().map(str::trim).find(|l| !l.is_empty());
        let log = lines.collect::<Vec<_>>().join("\n");

        let result = match first {
            Some(STATUS_IN_PROGRESS) => InfoResult::in_progress("Signing still in progress"),
            Some(STATUS_SUCCESS) => InfoResult::successful("Signing succeeded"),
            Some(STATUS_FAILED) => InfoResult::failed("Signing was rejected by the remote service"),
            Some(other) => {
                return Err(StageError::Parse(format!("unknown status line {other:?}")));
            }
            None => return Err(StageError::Parse("status command printed nothing".into())),
        };

        let log = log.trim();
        Ok(if log.is_empty() { result } else { result.with_log(log) })
    }

    async fn finalize(
        &self,
        request: &FinalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<FinalizeResult, StageError> {
        let Some(template) = &self.finalize else {
            return Err(StageError::Internal("no finalize command configured".into()));
        };
        let vars = Placeholders {
            file: Some(&request.file),
            id: None,
            options: &request.options,
        };
        let spec = self.spec(template, &vars, format!("{}-finalize-", file_stem(&request.file)))?;
        let output = self.runner.run(&spec, request.timeout, cancel).await?;

        if output.success() {
            let stdout = read_stdout(&output).await?;
            let message = stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .unwrap_or("Finalized");
            Ok(FinalizeResult::success(message))
        } else {
            Ok(FinalizeResult::error(format!(
                "Finalize command failed ({})",
                failure_detail(&output).await
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use notary_core::{FinalizeStatus, InfoStatus};

    use super::*;

    fn sh(script: &str) -> CommandTemplate {
        CommandTemplate::new("sh", ["-c", script])
    }

    fn adapter(upload: &str, poll: &str) -> CommandAdapter {
        CommandAdapter::new(sh(upload), sh(poll), ProcessRunner::new(Duration::from_millis(200)))
    }

    fn upload_request() -> UploadRequest {
        UploadRequest {
            file: PathBuf::from("/tmp/app-1234.zip"),
            options: JobOptions::new().with_param("bundle_id", "org.example.app"),
            timeout: Duration::from_secs(10),
        }
    }

    fn poll_request() -> PollRequest {
        PollRequest {
            correlation_id: "id-42".into(),
            options: JobOptions::new(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn renders_placeholders() {
        let options = JobOptions::new().with_param("bundle_id", "org.example");
        let vars = Placeholders {
            file: Some(Path::new("/pending/a.zip")),
            id: Some("abc"),
            options: &options,
        };
        assert_eq!(
            render_arg("--file={file} --id {id} -b {param.bundle_id}", &vars).unwrap(),
            "--file=/pending/a.zip --id abc -b org.example"
        );
        assert_eq!(render_arg("echo ${HOME} {", &vars).unwrap(), "echo ${HOME} {");
    }

    #[test]
    fn missing_parameter_is_an_internal_error() {
        let options = JobOptions::new();
        let vars = Placeholders { file: None, id: None, options: &options };
        assert!(matches!(render_arg("{param.team}", &vars), Err(StageError::Internal(_))));
        assert!(matches!(render_arg("{file}", &vars), Err(StageError::Internal(_))));
    }

    #[test]
    fn parses_command_lines() {
        let t = CommandTemplate::parse("  tool upload  --file {file} ").unwrap();
        assert_eq!(t, CommandTemplate::new("tool", ["upload", "--file", "{file}"]));
        assert!(CommandTemplate::parse("   ").is_none());
    }

    #[tokio::test]
    async fn upload_reads_id_from_last_line() {
        let a = adapter("echo uploading {file} {param.bundle_id}; echo id-42", "true");
        let r = a.submit(&upload_request(), &CancellationToken::new()).await.unwrap();
        assert!(!r.is_failed());
        assert_eq!(r.correlation_id.as_deref(), Some("id-42"));
    }

    #[tokio::test]
    async fn upload_accepts_already_uploaded() {
        let a = adapter("echo 'already-uploaded id-7'", "true");
        let r = a.submit(&upload_request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(r, UploadResult::already_uploaded("id-7"));
    }

    #[tokio::test]
    async fn already_uploaded_must_be_a_separate_word() {
        let a = adapter("echo already-uploadedXYZ", "true");
        let r = a.submit(&upload_request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(r.correlation_id.as_deref(), Some("already-uploadedXYZ"));
        assert_ne!(r, UploadResult::already_uploaded("XYZ"));

        let bare = adapter("echo already-uploaded", "true");
        let err = bare.submit(&upload_request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StageError::Parse(_)));
    }

    #[tokio::test]
    async fn upload_failure_carries_stderr() {
        let a = adapter("echo 'quota exceeded' >&2; exit 2", "true");
        let r = a.submit(&upload_request(), &CancellationToken::new()).await.unwrap();
        assert!(r.is_failed());
        assert!(r.message.contains("exit code 2"));
        assert!(r.message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn upload_without_id_is_a_parse_error() {
        let a = adapter("true", "true");
        let err = a.submit(&upload_request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StageError::Parse(_)));
    }

    #[tokio::test]
    async fn upload_timeout_is_transient() {
        let a = adapter("exec sleep 30", "true");
        let mut request = upload_request();
        request.timeout = Duration::from_millis(100);
        let err = a.submit(&request, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn poll_maps_status_lines() {
        let token = CancellationToken::new();

        let r = adapter("true", "echo in-progress").poll_once(&poll_request(), &token).await.unwrap();
        assert_eq!(r.status, InfoStatus::InProgress);

        let r = adapter("true", "printf 'success\\nline one\\nline two\\n'")
            .poll_once(&poll_request(), &token)
            .await
            .unwrap();
        assert_eq!(r.status, InfoStatus::Successful);
        assert_eq!(r.log.as_deref(), Some("line one\nline two"));

        let r = adapter("true", "echo failed; echo 'bad signature'")
            .poll_once(&poll_request(), &token)
            .await
            .unwrap();
        assert_eq!(r.status, InfoStatus::Failed);
        assert_eq!(r.log.as_deref(), Some("bad signature"));
    }

    #[tokio::test]
    async fn poll_passes_correlation_id() {
        let a = adapter("true", "test {id} = id-42 && echo success || echo failed");
        let r = a.poll_once(&poll_request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(r.status, InfoStatus::Successful);
    }

    #[tokio::test]
    async fn poll_failure_is_a_retrieval_failure() {
        let a = adapter("true", "echo 'service unavailable' >&2; exit 1");
        let r = a.poll_once(&poll_request(), &CancellationToken::new()).await.unwrap();
        assert!(r.is_retrieval_failure());
    }

    #[tokio::test]
    async fn poll_rejects_unknown_status() {
        let a = adapter("true", "echo maybe");
        let err = a.poll_once(&poll_request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StageError::Parse(_)));
    }

    #[tokio::test]
    async fn finalize_follows_exit_code() {
        let request = FinalizeRequest {
            file: PathBuf::from("/tmp/app.zip"),
            options: JobOptions::new(),
            timeout: Duration::from_secs(10),
        };
        let token = CancellationToken::new();

        let ok = adapter("true", "true").with_finalize(sh("echo stapled {file}"));
        let r = ok.finalize(&request, &token).await.unwrap();
        assert_eq!(r.status, FinalizeStatus::Success);
        assert_eq!(r.message, "stapled /tmp/app.zip");

        let bad = adapter("true", "true").with_finalize(sh("exit 65"));
        assert!(bad.finalize(&request, &token).await.unwrap().is_error());

        let missing = adapter("true", "true");
        assert!(matches!(
            missing.finalize(&request, &token).await,
            Err(StageError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn environment_reaches_the_command() {
        let a = adapter("echo \"token-$SIGNING_TOKEN\"", "true").with_env("SIGNING_TOKEN", "s3cr3t");
        let r = a.submit(&upload_request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(r.correlation_id.as_deref(), Some("token-s3cr3t"));
    }
}
