use crate::llm::Provider;
use std::fmt;

/// Narrative call failure with enough of the raw exchange attached to debug it later.
#[derive(Debug, Clone)]
pub struct LlmDiagnosticsError {
    pub provider: Provider,
    pub stage: &'static str,
    pub detail: String,
    pub status: Option<u16>,
    pub raw_output: Option<String>,
}

impl fmt::Display for LlmDiagnosticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LLM error (provider={:?}, stage={}",
            self.provider, self.stage
        )?;
        if let Some(status) = self.status {
            write!(f, ", status={status}")?;
        }
        write!(f, "): {}", self.detail)
    }
}

impl std::error::Error for LlmDiagnosticsError {}
