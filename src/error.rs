use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input rejected before it reaches any computation.
    Validation,
    /// A caller supplied an identifier that does not exist.
    NotFound,
    Storage,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize)]
#[error("{}: {message}", kind.as_str())]
pub struct CalcError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl From<rusqlite::Error> for CalcError {
    fn from(e: rusqlite::Error) -> Self {
        CalcError::storage(e.to_string())
    }
}

pub type CalcResult<T> = Result<T, CalcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_includes_kind_code() {
        let e = CalcError::not_found("exam not found");
        assert_eq!(e.to_string(), "not_found: exam not found");
        assert!(e.is_not_found());
    }

    #[test]
    fn details_serialize_only_when_present() {
        let plain = serde_json::to_value(CalcError::validation("bad")).expect("serialize");
        assert_eq!(plain, json!({ "kind": "validation", "message": "bad" }));

        let detailed = CalcError::validation("weightage out of range")
            .with_details(json!({ "field": "weightage" }));
        let v = serde_json::to_value(detailed).expect("serialize");
        assert_eq!(v["details"]["field"], "weightage");
    }
}
