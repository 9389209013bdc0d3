use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BmsError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("`{tool}` is not installed or not on PATH")]
    ToolMissing { tool: String },
    #[error("process error: {message}")]
    Tool {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("provisioning failed: {message}")]
    Provisioning {
        message: String,
        output: Option<String>,
    },
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_excerpt: Option<String>,
}

impl BmsError {
    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            Self::Tool { details, .. } => Some(details.clone()),
            Self::ToolMissing { tool } => Some(ProcessErrorDetails {
                error_code: "tool_missing".to_string(),
                hint: Some(format!("Install `{tool}` and ensure it is on your PATH.")),
                command: None,
                output_excerpt: None,
            }),
            Self::Provisioning { output, .. } => Some(ProcessErrorDetails {
                error_code: "provisioning_failed".to_string(),
                hint: None,
                command: None,
                output_excerpt: output.clone(),
            }),
            Self::Validation { message } => Some(ProcessErrorDetails {
                error_code: "validation_failed".to_string(),
                hint: None,
                command: None,
                output_excerpt: Some(message.clone()),
            }),
            _ => None,
        }
    }
}
