use std::process::Stdio;

use async_trait::async_trait;
use rexrender::{
    job::Job,
    render::{RenderError, RenderReporter, Renderer},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
};

/// Renders a job by running an external command.
///
/// The job is written to the command's stdin as JSON. While it runs the command may print
/// `progress <percent>` lines to report progress and `error <message>` lines to report errors
/// that do not stop the render. Any other output is ignored. A non zero exit status fails the
/// job with the last line the command wrote to stderr.
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

enum Line<'a> {
    Progress(f64),
    Error(&'a str),
}

fn parse_line(line: &str) -> Option<Line<'_>> {
    let (keyword, rest) = line.trim().split_once(' ')?;
    match keyword {
        "progress" => rest.trim().parse().ok().map(Line::Progress),
        "error" => Some(Line::Error(rest.trim())),
        _ => None,
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, mut job: Job, reporter: &dyn RenderReporter) -> Result<Job, RenderError> {
        let program = &self.program;
        let input = serde_json::to_vec(&job)
            .map_err(|error| RenderError::preparation(format!("Failed to encode job: {error}")))?;

        let mut child = Command::new(program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| RenderError::engine(format!("Failed to start {program}: {error}")))?;
        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RenderError::engine(format!("Failed to attach to {program}")));
        };

        let write_job = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
            Ok::<_, std::io::Error>(())
        };
        let read_stderr = async move {
            let mut output = String::new();
            let _ = stderr.read_to_string(&mut output).await;
            output
        };
        let report = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(|error| {
                RenderError::engine(format!("Failed to read output of {program}: {error}"))
            })? {
                match parse_line(&line) {
                    Some(Line::Progress(percent)) => reporter.progress(&mut job, percent).await?,
                    Some(Line::Error(message)) => {
                        reporter.error(&mut job, &RenderError::engine(message)).await
                    }
                    None => tracing::trace!(%line, "{program}: {line}"),
                }
            }
            Ok::<_, RenderError>(())
        };

        let (written, stderr, reported) = tokio::join!(write_job, read_stderr, report);
        reported?;
        if let Err(error) = written {
            tracing::debug!(?error, "{program} did not read the whole job: {error}");
        }

        let status = child
            .wait()
            .await
            .map_err(|error| RenderError::engine(format!("Failed to wait for {program}: {error}")))?;
        if !status.success() {
            let reason = stderr.lines().last().unwrap_or_default();
            return Err(RenderError::engine(format!("{program} failed ({status}): {reason}")));
        }
        Ok(job)
    }
}
