use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Entity ids are caller-assigned strings (the model may mint its own).
pub type EntityId = String;
pub type CallId = Uuid;
pub type TaskId = Uuid;

/// What an LLM invocation was issued for. Drives ledger filtering and
/// prompt selection; carries no behavior of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    UserEdit,
    PipelinePlanning,
    PipelineGeneration,
    PipelineValidation,
    FeedbackAnalysis,
    Other(String),
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallType::UserEdit => "user_edit",
            CallType::PipelinePlanning => "pipeline_planning",
            CallType::PipelineGeneration => "pipeline_generation",
            CallType::PipelineValidation => "pipeline_validation",
            CallType::FeedbackAnalysis => "feedback_analysis",
            CallType::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_edit" => Ok(CallType::UserEdit),
            "pipeline_planning" => Ok(CallType::PipelinePlanning),
            "pipeline_generation" => Ok(CallType::PipelineGeneration),
            "pipeline_validation" => Ok(CallType::PipelineValidation),
            "feedback_analysis" => Ok(CallType::FeedbackAnalysis),
            other => Ok(CallType::Other(other.to_string())),
        }
    }
}

/// Lifecycle of a ledger entry. Strictly monotonic:
/// `Queued -> Running -> (Completed | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Failed)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CallStatus::Queued | CallStatus::Running)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Queued, CallStatus::Running)
                | (CallStatus::Running, CallStatus::Completed)
                | (CallStatus::Running, CallStatus::Failed)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Queued => "queued",
            CallStatus::Running => "running",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A message in the conversation sent to the completion capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Hints forwarded to the completion capability. The core never talks to
/// a concrete provider; these are advisory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Preferred model identifier, if the provider supports selection.
    pub model_hint: Option<String>,
    /// Expected shape of the response body.
    pub response_format: ResponseFormat,
}

impl ChatOptions {
    pub fn json() -> Self {
        Self {
            model_hint: None,
            response_format: ResponseFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// One hit returned by the web search capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub description: String,
}
