//! External code-modifying agent wire contract (spec.md §4.11 step 7, §9).
//!
//! The agent is modeled as a subprocess with a strict contract: given a
//! prompt file, it either emits a `{"paramOverrides": {...}}` JSON blob on
//! stdout (refine phase) or rewrites the strategy source file in place
//! (restructure phase). The orchestrator never trusts the agent to mutate
//! parameter history directly (spec.md §9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::domain::ports::{ModifierOutcome, StrategyModifier};

#[derive(Debug, Deserialize)]
struct ParamOverridesPayload {
    #[serde(rename = "paramOverrides")]
    param_overrides: HashMap<String, f64>,
}

/// Dispatches to the external modifier as a child process, scoped so the
/// child is always killed (term then kill) and its handle released on any
/// exit path, even a timeout (spec.md §5 "Scoped subprocess").
pub struct ProcessModifier {
    command: PathBuf,
    strategy_source_path: PathBuf,
}

impl ProcessModifier {
    pub fn new(command: PathBuf, strategy_source_path: PathBuf) -> Self {
        Self { command, strategy_source_path }
    }
}

#[async_trait]
impl StrategyModifier for ProcessModifier {
    async fn invoke(&self, prompt_path: &Path, timeout: Duration) -> Result<ModifierOutcome> {
        let before = tokio::fs::read(&self.strategy_source_path)
            .await
            .context("reading strategy source before modifier invocation")?;

        let mut child = Command::new(&self.command)
            .arg(prompt_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning external modifier process")?;

        let mut stdout_pipe = child.stdout.take();
        let wait = tokio::time::timeout(timeout, child.wait()).await;

        let status = match wait {
            Ok(result) => result.context("waiting on external modifier process")?,
            Err(_) => {
                let _ = child.start_kill();
                bail!(
                    "external modifier timed out after {}s",
                    timeout.as_secs()
                );
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }

        if !status.success() {
            bail!("external modifier exited with {status}, stdout: {stdout}");
        }

        let after = tokio::fs::read(&self.strategy_source_path)
            .await
            .context("reading strategy source after modifier invocation")?;

        if after != before {
            return Ok(ModifierOutcome::SourceRewritten { new_source: after });
        }

        let payload: ParamOverridesPayload = serde_json::from_str(stdout.trim())
            .context("parsing modifier stdout as {paramOverrides} JSON")?;
        Ok(ModifierOutcome::ParamOverrides(payload.param_overrides))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_overrides_payload_parses_camel_case_field() {
        let raw = r#"{"paramOverrides": {"atr_mult": 2.3}}"#;
        let parsed: ParamOverridesPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.param_overrides["atr_mult"], 2.3);
    }
}
