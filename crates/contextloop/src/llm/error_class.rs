use crate::error::Error;

/// Actionable classification of LLM transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request exceeded the model's context window. With correct
    /// budgeting this never happens, so seeing it means the budget math or
    /// the tokenizer estimate is off.
    ContextOverflow,
    /// Rate limited (HTTP 429).
    RateLimited,
    /// Authentication failure (HTTP 401/403).
    AuthError,
    /// Server-side failure (HTTP 500/502/503/529).
    ServerError,
    /// Client error that is not overflow (other HTTP 400).
    InvalidRequest,
    /// Unrecognized error.
    Unknown,
}

impl ErrorClass {
    /// Stable snake_case label for structured log fields.
    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::ContextOverflow => "context_overflow",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::AuthError => "auth_error",
            ErrorClass::ServerError => "server_error",
            ErrorClass::InvalidRequest => "invalid_request",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Classify an [`Error`] into an [`ErrorClass`].
///
/// Only `Error::Api` carries enough information; everything else is `Unknown`.
pub fn classify(error: &Error) -> ErrorClass {
    match error {
        Error::Api { status, message } => classify_api(*status, message),
        _ => ErrorClass::Unknown,
    }
}

fn classify_api(status: u16, message: &str) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::AuthError,
        429 => ErrorClass::RateLimited,
        500 | 502 | 503 | 529 => ErrorClass::ServerError,
        400 | 413 => {
            if is_context_overflow(message) {
                ErrorClass::ContextOverflow
            } else {
                ErrorClass::InvalidRequest
            }
        }
        _ => ErrorClass::Unknown,
    }
}

/// Case-insensitive substring match against known overflow messages.
fn is_context_overflow(message: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "prompt is too long",
        "maximum context length",
        "context_length_exceeded",
        "context window",
        "too many tokens",
        "input is too long",
        "exceeds the model's maximum context",
        "request too large",
    ];

    let lower = message.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}
