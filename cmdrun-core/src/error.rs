use crate::models::{CallbackError, SubArg};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmdrunError {
    #[error("Invalid timeout spec: {0}")]
    InvalidTimeoutSpec(String),

    #[error("Illegal sub command '{sub_command}'. Expected one of {}", format_allowed(.allowed))]
    SubCommandNotAllowed {
        sub_command: SubArg,
        allowed: Vec<SubArg>,
    },

    #[error("Usage error: {0}")]
    Usage(String),

    /// Raised by an escalation callback. Carries the callback's own error
    /// untouched; the child has already been killed and reaped.
    #[error(transparent)]
    ActionCallback(CallbackError),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl CmdrunError {
    /// Returns the original callback failure, if this error came from one.
    pub fn into_callback_error(self) -> Option<CallbackError> {
        match self {
            CmdrunError::ActionCallback(err) => Some(err),
            _ => None,
        }
    }
}

fn format_allowed(allowed: &[SubArg]) -> String {
    let items: Vec<String> = allowed.iter().map(|a| format!("{:?}", a)).collect();
    format!("[{}]", items.join(", "))
}

pub type Result<T> = std::result::Result<T, CmdrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct KillMeNow;

    impl std::fmt::Display for KillMeNow {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "KillMeNow")
        }
    }

    impl std::error::Error for KillMeNow {}

    #[test]
    fn test_callback_error_is_transparent() {
        let err = CmdrunError::ActionCallback(Box::new(KillMeNow));
        assert_eq!(err.to_string(), "KillMeNow");

        let original = err.into_callback_error().unwrap();
        assert!(original.downcast_ref::<KillMeNow>().is_some());
    }

    #[test]
    fn test_sub_command_not_allowed_message() {
        let err = CmdrunError::SubCommandNotAllowed {
            sub_command: SubArg::from("lib"),
            allowed: vec![SubArg::from("/tmp"), SubArg::symbol("test")],
        };
        assert_eq!(
            err.to_string(),
            "Illegal sub command 'lib'. Expected one of [Text(\"/tmp\"), Symbol(\"test\")]"
        );
    }

    #[test]
    fn test_non_callback_error_has_no_callback_source() {
        let err = CmdrunError::Usage("mixed".to_string());
        assert!(err.into_callback_error().is_none());
    }
}
