//! Invocation recording
//!
//! Console lines and gate metadata land on the invocation so that discovery
//! can later tell the gate ran there.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::types::GateResult;

pub const MARKER_FILE: &str = "armorcode-gate-used.txt";
pub const PARAMS_FILE: &str = "gate-params.json";
pub const PARAM_PREFIX: &str = "ArmorCode.";

/// Metadata recorded once the gate reaches a verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateMetadata {
    #[serde(rename = "ArmorCode.GateUsed")]
    pub gate_used: String,
    #[serde(rename = "ArmorCode.Product")]
    pub product: String,
    #[serde(rename = "ArmorCode.SubProducts")]
    pub sub_products: String,
    #[serde(rename = "ArmorCode.Env")]
    pub env: String,
    #[serde(rename = "ArmorCode.GateResult")]
    pub result: String,
}

impl GateMetadata {
    /// Degraded runs record `FAIL`; only a clean pass records `PASS`.
    pub fn new(product: &str, sub_products: &str, env: &str, result: GateResult) -> Self {
        let result = match result {
            GateResult::Pass => "PASS",
            GateResult::Fail | GateResult::Degraded => "FAIL",
        };
        Self {
            gate_used: "true".to_string(),
            product: product.to_string(),
            sub_products: sub_products.to_string(),
            env: env.to_string(),
            result: result.to_string(),
        }
    }
}

/// Where a gate invocation writes what it does
pub trait InvocationContext: Send + Sync {
    fn console(&self, line: &str);
    fn record(&self, metadata: &GateMetadata) -> Result<()>;
}

/// Writes into a run directory laid out like a CI build dir
pub struct RunDirInvocation {
    run_dir: PathBuf,
    echo: bool,
}

impl RunDirInvocation {
    pub fn new(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let run_dir = run_dir.into();
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run dir {}", run_dir.display()))?;
        Ok(Self { run_dir, echo: true })
    }

    /// Don't mirror console lines to stdout
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn append_log(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("log"))?;
        writeln!(file, "{}", line)
    }
}

impl InvocationContext for RunDirInvocation {
    fn console(&self, line: &str) {
        if self.echo {
            println!("{}", line);
        }
        if let Err(e) = self.append_log(line) {
            tracing::warn!("Failed to append to run log: {}", e);
        }
    }

    fn record(&self, metadata: &GateMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(self.run_dir.join(PARAMS_FILE), json).context("Failed to write gate parameters")?;
        std::fs::write(self.run_dir.join(MARKER_FILE), format!("result={}\n", metadata.result))
            .context("Failed to write gate marker")?;
        Ok(())
    }
}

/// Console only. Metadata goes to the log.
pub struct ConsoleInvocation;

impl InvocationContext for ConsoleInvocation {
    fn console(&self, line: &str) {
        println!("{}", line);
    }

    fn record(&self, metadata: &GateMetadata) -> Result<()> {
        tracing::info!(result = %metadata.result, product = %metadata.product, "Gate metadata");
        Ok(())
    }
}

/// In-memory invocation for tests and embedding
#[derive(Default)]
pub struct MemoryInvocation {
    lines: Mutex<Vec<String>>,
    metadata: Mutex<Vec<GateMetadata>>,
}

impl MemoryInvocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn output(&self) -> String {
        self.lines().join("\n")
    }

    pub fn recorded(&self) -> Vec<GateMetadata> {
        self.metadata.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl InvocationContext for MemoryInvocation {
    fn console(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }

    fn record(&self, metadata: &GateMetadata) -> Result<()> {
        if let Ok(mut recorded) = self.metadata.lock() {
            recorded.push(metadata.clone());
        }
        Ok(())
    }
}
