//! Build output normalization.
//!
//! Filters the Docker engine's JSON-lines build output so that injected
//! instructions disappear from the user's view and the remaining `Step n/m`
//! lines count only the user's own instructions.

use std::sync::LazyLock;

use a3s_box_core::error::{BoxError, Result};
use a3s_box_core::log::BuildLogRecord;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::inject::BUILD_LABEL;

/// Replaces the first injected step of every stage.
pub const INTERCEPTION_NOTICE: &str = "*** Enabling A3S Box build interception ***\n";

static STEP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(step) (\d+)/(\S*?) ?:").expect("valid step regex"));

static END_OF_STEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ ---> [0-9a-f]+\n?$").expect("valid end-of-step regex"));

static INJECTION_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"{}[= ]"?(started-)?(\d+)"#,
        regex::escape(BUILD_LABEL)
    ))
    .expect("valid label regex")
});

/// A `Step n/m :` progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLine<'a> {
    /// The `Step` keyword as written
    pub keyword: &'a str,
    pub step: &'a str,
    /// Raw total; not guaranteed to be numeric
    pub total: &'a str,
    /// Byte range of `Step n/m` within the text
    pub span: std::ops::Range<usize>,
}

impl StepLine<'_> {
    /// The total step count reported by the engine.
    pub fn total_steps(&self) -> Result<usize> {
        self.total.parse().map_err(|_| {
            BoxError::BuildLogFormat(format!(
                "Could not read total step count from '{} {}/{}'",
                self.keyword, self.step, self.total
            ))
        })
    }
}

/// Which of the two injection labels a line mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionMarker {
    Start { proxy_port: u16 },
    End { proxy_port: u16 },
}

pub fn match_step_line(text: &str) -> Option<StepLine<'_>> {
    let caps = STEP_LINE.captures(text)?;
    let keyword = caps.get(1)?;
    let total = caps.get(3)?;
    Some(StepLine {
        keyword: keyword.as_str(),
        step: caps.get(2)?.as_str(),
        total: total.as_str(),
        span: keyword.start()..total.end(),
    })
}

/// Matches the ` ---> <image id>` line printed when an instruction completes.
pub fn match_end_of_step(text: &str) -> Option<&str> {
    END_OF_STEP
        .is_match(text)
        .then(|| text.trim_start_matches(" ---> ").trim_end_matches('\n'))
}

pub fn match_injection_label(text: &str) -> Option<InjectionMarker> {
    let caps = INJECTION_LABEL.captures(text)?;
    let proxy_port = caps.get(2)?.as_str().parse().ok()?;
    Some(if caps.get(1).is_some() {
        InjectionMarker::Start { proxy_port }
    } else {
        InjectionMarker::End { proxy_port }
    })
}

/// What is currently being hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFilter {
    #[default]
    None,
    All,
    UntilNextStep,
}

/// Step numbering as seen by the user.
#[derive(Debug, Clone, Default)]
struct StepCounter {
    visible: usize,
    total: Option<usize>,
}

/// Per-build output filter. Create one per build; never share.
#[derive(Debug)]
pub struct BuildOutputPipeline {
    extra_commands: usize,
    filter: OutputFilter,
    steps: StepCounter,
}

/// Create the output filter for a build with `extra_commands` injected instructions.
pub fn build_output_pipeline(extra_commands: usize) -> BuildOutputPipeline {
    BuildOutputPipeline::new(extra_commands)
}

impl BuildOutputPipeline {
    pub fn new(extra_commands: usize) -> Self {
        Self {
            extra_commands,
            filter: OutputFilter::None,
            steps: StepCounter::default(),
        }
    }

    pub fn filter(&self) -> OutputFilter {
        self.filter
    }

    /// Process one JSON line; returns the line to emit, if any.
    pub fn process_line(&mut self, line: &str) -> Result<Option<String>> {
        if line.trim().is_empty() {
            return Ok(Some(line.to_string()));
        }

        let record = BuildLogRecord::parse(line)?;
        let Some(text) = record.stream.as_deref() else {
            return Ok(Some(line.to_string()));
        };

        let step = match_step_line(text);
        if let Some(step) = &step {
            if self.steps.total.is_none() {
                let total = step.total_steps()?;
                let adjusted = total.checked_sub(self.extra_commands).ok_or_else(|| {
                    BoxError::BuildLogFormat(format!(
                        "Build reports {} steps but {} were injected",
                        total, self.extra_commands
                    ))
                })?;
                self.steps.total = Some(adjusted);
            }
        }

        match self.filter {
            OutputFilter::None => {
                if let Some(InjectionMarker::Start { .. }) = match_injection_label(text) {
                    tracing::debug!("Hiding injected build steps");
                    self.filter = OutputFilter::All;
                    let notice = BuildLogRecord::from_stream(INTERCEPTION_NOTICE);
                    return Ok(Some(notice.to_json_line()?));
                }
            }
            OutputFilter::All => {
                if text.contains(BUILD_LABEL) {
                    self.filter = OutputFilter::UntilNextStep;
                }
                return Ok(None);
            }
            OutputFilter::UntilNextStep => {
                if match_end_of_step(text).is_none() {
                    return Ok(None);
                }
                tracing::debug!("Injected build steps finished");
                self.filter = OutputFilter::None;
            }
        }

        match step {
            Some(step) => {
                self.steps.visible += 1;
                let total = self.steps.total.unwrap_or_default();
                let rewritten = format!(
                    "{}{} {}/{}{}",
                    &text[..step.span.start],
                    step.keyword,
                    self.steps.visible,
                    total,
                    &text[step.span.end..]
                );
                let record = BuildLogRecord {
                    stream: Some(rewritten),
                    ..record
                };
                Ok(Some(record.to_json_line()?))
            }
            None => Ok(Some(line.to_string())),
        }
    }

    /// Filter a whole output stream, writing one record per line.
    pub async fn pipe<R, W>(mut self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(output) = self.process_line(&line)? {
                writer.write_all(output.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }
}
