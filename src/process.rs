use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// HTTP 429 as reported by ccxt and requests; a bare "429" elsewhere is not throttling.
static RE_RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)too many requests|\b429\b.*(too many|rate)|status(?: code)?:? 429")
        .expect("static regex")
});

const FAILURE_TAIL_LINES: usize = 20;

/// Captured result of one blocking tool invocation.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    pub tool: String,
    pub code: Option<i32>,
    pub success: bool,
    /// Stdout followed by stderr.
    pub text: String,
}

impl ToolOutput {
    /// Turns a failed exit into the matching error, keeping only the output tail.
    pub fn into_success(self) -> Result<String> {
        if self.success {
            return Ok(self.text);
        }
        if RE_RATE_LIMIT.is_match(&self.text) {
            return Err(PipelineError::RateLimited { tool: self.tool });
        }
        Err(PipelineError::ExternalToolFailure {
            detail: tail(&self.text, FAILURE_TAIL_LINES),
            tool: self.tool,
            code: self.code,
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let from = all.len().saturating_sub(lines);
    all[from..].join("\n")
}

/// Runs `program args..` to completion and captures both output streams.
pub fn run_tool(program: &str, args: &[String]) -> Result<ToolOutput> {
    let tool = args
        .first()
        .map(|sub| format!("{program} {sub}"))
        .unwrap_or_else(|| program.to_string());
    info!(%tool, args = %args.join(" "), "starting process");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| PipelineError::ExternalToolFailure {
            tool: tool.clone(),
            code: None,
            detail: format!("spawn failed: {e}"),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stdout.lines().chain(stderr.lines()) {
        debug!(target: "pair_sweep::engine", "{line}");
    }

    let mut text = stdout.into_owned();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&stderr);

    let code = output.status.code();
    info!(%tool, ?code, "process exited");
    Ok(ToolOutput {
        tool,
        code,
        success: output.status.success(),
        text,
    })
}
