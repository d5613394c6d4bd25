//! Gateway error types

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static CREDENTIAL_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([?&]key=)[^&\s]*").expect("valid regex"));

/// Mask `key=` query values in text that may echo a request URL
pub fn redact_credentials(text: &str) -> String {
    CREDENTIAL_PARAM
        .replace_all(text, "${1}[REDACTED]")
        .into_owned()
}

/// Error type for model invocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No credential was supplied
    MissingCredential,

    /// No model identifier was supplied
    MissingModel,

    /// The request target is not a well-formed URL
    InvalidEndpoint { url: String, reason: String },

    /// Transport failure (DNS, TLS, connection reset, timeout)
    Network(String),

    /// Non-success HTTP status
    Api { status: u16, message: String },

    /// The prompt was blocked before generation
    BlockedPrompt {
        reason: String,
        safety: Option<String>,
    },

    /// The response carried no generation candidate
    NoCandidates,

    /// Generation ended for a reason other than a normal stop or max length
    GenerationStopped {
        reason: String,
        safety: Option<String>,
    },

    /// Text could not be extracted from an otherwise successful candidate
    MalformedResponse,
}

impl GatewayError {
    /// Whether a retry may succeed (transport failures, rate limits, 5xx)
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) => true,
            GatewayError::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::MissingCredential => write!(f, "API Key is missing or not selected."),
            GatewayError::MissingModel => write!(f, "Model name is missing."),
            GatewayError::InvalidEndpoint { url, reason } => {
                write!(
                    f,
                    "Invalid API URL ({}). Check model configuration. Original error: {}",
                    url, reason
                )
            }
            GatewayError::Network(msg) => {
                write!(f, "Network error while calling Gemini API: {}", msg)
            }
            GatewayError::Api { status, message } => {
                write!(f, "API Error ({}): {}", status, message)
            }
            GatewayError::BlockedPrompt { reason, safety } => {
                write!(f, "Prompt was blocked by the API. Reason: {}.", reason)?;
                if let Some(safety) = safety {
                    write!(f, " Details: {}", safety)?;
                }
                Ok(())
            }
            GatewayError::NoCandidates => write!(f, "No candidates found in API response."),
            GatewayError::GenerationStopped { reason, safety } => {
                write!(f, "Generation stopped due to: {}.", reason)?;
                if let Some(safety) = safety {
                    write!(f, " Safety Ratings: {}", safety)?;
                }
                Ok(())
            }
            GatewayError::MalformedResponse => {
                write!(f, "Could not extract generated text from API response structure.")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ureq::Transport> for GatewayError {
    fn from(err: ureq::Transport) -> Self {
        // Transport's Display starts with the request URL, key included
        let detail = match err.message() {
            Some(message) => format!("{}: {}", err.kind(), message),
            None => err.kind().to_string(),
        };
        GatewayError::Network(redact_credentials(&detail))
    }
}
