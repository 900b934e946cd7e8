//! Submit one file through command line tools and wait for the outcome.
//!
//! ```text
//! notary-submit <file> [--finalize] [--param NAME=VALUE]... [--out PATH]
//! ```
//!
//! Tools are configured through the environment:
//! `NOTARY_UPLOAD_COMMAND`, `NOTARY_POLL_COMMAND` and optionally
//! `NOTARY_FINALIZE_COMMAND` (see `CommandAdapter` for placeholders and the
//! output contract). Engine settings come from the other `NOTARY_*` variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use notary_core::{JobOptions, State};
use notary_infra::{CommandAdapter, CommandTemplate, EngineConfig, ProcessRunner, SubmissionService};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "notary-submit", about = "Submit a file for signing and wait for the outcome")]
struct Cli {
    /// Payload to submit
    file: PathBuf,
    /// Run the finalize command after a successful signing
    #[arg(long)]
    finalize: bool,
    /// Job parameter forwarded to the tool commands as `{param.NAME}`
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Where to copy the processed artifact
    #[arg(long)]
    out: Option<PathBuf>,
}

impl Cli {
    fn options(&self) -> JobOptions {
        self.params
            .iter()
            .fold(JobOptions::new().with_finalize(self.finalize), |options, (name, value)| {
                options.with_param(name.as_str(), value.as_str())
            })
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("{raw:?} is not NAME=VALUE")),
    }
}

fn command_from_env(key: &str) -> anyhow::Result<Option<CommandTemplate>> {
    match std::env::var(key) {
        Ok(line) => CommandTemplate::parse(&line)
            .map(Some)
            .with_context(|| format!("{key} is empty")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {key}")),
    }
}

fn adapter_from_env(config: &EngineConfig) -> anyhow::Result<CommandAdapter> {
    let upload = command_from_env("NOTARY_UPLOAD_COMMAND")?.context("NOTARY_UPLOAD_COMMAND is not set")?;
    let poll = command_from_env("NOTARY_POLL_COMMAND")?.context("NOTARY_POLL_COMMAND is not set")?;

    let mut adapter = CommandAdapter::new(upload, poll, ProcessRunner::new(config.process.grace_period));
    if let Some(finalize) = command_from_env("NOTARY_FINALIZE_COMMAND")? {
        adapter = adapter.with_finalize(finalize);
    }
    Ok(adapter)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notary_observability::init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("invalid NOTARY_* configuration")?;
    let adapter = adapter_from_env(&config)?;

    let service = SubmissionService::new(config, adapter, tokio::runtime::Handle::current());
    service.prepare().await?;

    let body = tokio::fs::File::open(&cli.file)
        .await
        .with_context(|| format!("opening {}", cli.file.display()))?;
    let filename = cli.file.file_name().map(|n| n.to_string_lossy().into_owned());
    let submitted = service.submit(body, filename.as_deref(), cli.options()).await?;
    println!("{}", serde_json::to_string(&submitted)?);

    let handle = submitted.handle;
    let mut last = submitted.status;
    while !last.is_terminal() {
        tokio::time::sleep(STATUS_INTERVAL).await;
        let current = service.query_status(handle)?;
        if current.status.message != last.message || current.status.state != last.state {
            println!("{}", serde_json::to_string(&current)?);
        }
        last = current.status;
    }

    if last.state != State::Complete {
        bail!("submission {handle} failed: {}", last.message);
    }

    if let Some(out) = cli.out {
        let mut artifact = service.fetch_artifact(handle).await?;
        let mut target = tokio::fs::File::create(&out)
            .await
            .with_context(|| format!("creating {}", out.display()))?;
        tokio::io::copy(&mut artifact.file, &mut target).await?;
        tracing::info!(%handle, out = %out.display(), "artifact written");
    }

    Ok(())
}
