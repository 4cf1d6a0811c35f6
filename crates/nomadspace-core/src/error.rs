//! Error taxonomy for NomadSpace.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading, namespacing, submitting or rendering jobs.
#[derive(Error, Debug)]
pub enum NomadSpaceError {
    /// Filesystem access failed
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON job document could not be decoded
    #[error("failed to parse {file}: {source}")]
    ParseJson {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    /// The scheduler rejected a native-syntax job document
    #[error("failed to parse {file}: {reason}")]
    ParseNative { file: String, reason: String },

    /// Registration of a namespaced job failed
    #[error("failed to submit {file} as {job_id}: {source}")]
    Submit {
        file: String,
        job_id: String,
        #[source]
        source: Box<NomadSpaceError>,
    },

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success response from the scheduler or KV store
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Template could not be parsed or rendered
    #[error("template {template}: {reason}")]
    Template { template: String, reason: String },

    /// The template engine stopped with a fatal error
    #[error("template engine error: {0}")]
    Engine(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A supervised subsystem panicked or was aborted
    #[error("subsystem {name} failed to complete: {reason}")]
    Subsystem { name: String, reason: String },

    /// The process-wide cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// Several independent failures, flattened
    #[error("{0}")]
    Multiple(ErrorList),
}

impl From<reqwest::Error> for NomadSpaceError {
    fn from(err: reqwest::Error) -> Self {
        NomadSpaceError::Http(err.to_string())
    }
}

impl NomadSpaceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NomadSpaceError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when every underlying error is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            NomadSpaceError::Cancelled => true,
            NomadSpaceError::Multiple(list) => {
                !list.is_empty() && list.iter().all(NomadSpaceError::is_cancellation)
            }
            _ => false,
        }
    }
}

/// Result type for NomadSpace operations.
pub type Result<T> = std::result::Result<T, NomadSpaceError>;

/// A flat list of errors.
///
/// Appending is associative: pushing a `Multiple` splices its members in
/// rather than nesting, so the combined message lists every failure once
/// regardless of how the errors were grouped.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<NomadSpaceError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error, flattening nested lists.
    pub fn push(&mut self, err: NomadSpaceError) {
        match err {
            NomadSpaceError::Multiple(list) => self.0.extend(list.0),
            other => self.0.push(other),
        }
    }

    /// Append the error side of a result, if any.
    pub fn push_result<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NomadSpaceError> {
        self.0.iter()
    }

    /// Collapse into a single result: `Ok` when empty, the lone error when
    /// there is exactly one, `Multiple` otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(NomadSpaceError::Multiple(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.0.len() == 1 { "error" } else { "errors" };
        writeln!(f, "{} {} occurred:", self.0.len(), noun)?;
        for err in &self.0 {
            writeln!(f, "\t* {}", err)?;
        }
        Ok(())
    }
}

impl FromIterator<NomadSpaceError> for ErrorList {
    fn from_iter<I: IntoIterator<Item = NomadSpaceError>>(iter: I) -> Self {
        let mut list = ErrorList::new();
        for err in iter {
            list.push(err);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn test_single_error_is_not_wrapped() {
        let mut list = ErrorList::new();
        list.push(NomadSpaceError::Config("bad".to_string()));
        let err = list.into_result().unwrap_err();
        assert!(matches!(err, NomadSpaceError::Config(_)));
    }

    #[test]
    fn test_nested_lists_are_flattened() {
        let inner: ErrorList = vec![
            NomadSpaceError::Engine("a".to_string()),
            NomadSpaceError::Engine("b".to_string()),
        ]
        .into_iter()
        .collect();

        let mut outer = ErrorList::new();
        outer.push(NomadSpaceError::Config("c".to_string()));
        outer.push(NomadSpaceError::Multiple(inner));
        assert_eq!(outer.len(), 3);

        let msg = outer.into_result().unwrap_err().to_string();
        assert!(msg.starts_with("3 errors occurred:"));
        assert!(msg.contains("* template engine error: a"));
        assert!(msg.contains("* template engine error: b"));
        assert!(msg.contains("* configuration error: c"));
    }

    #[test]
    fn test_push_result_keeps_values() {
        let mut list = ErrorList::new();
        assert_eq!(list.push_result(Ok(3)), Some(3));
        assert_eq!(list.push_result::<i32>(Err(NomadSpaceError::Cancelled)), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_is_cancellation() {
        assert!(NomadSpaceError::Cancelled.is_cancellation());

        let all_cancelled: ErrorList =
            vec![NomadSpaceError::Cancelled, NomadSpaceError::Cancelled]
                .into_iter()
                .collect();
        assert!(NomadSpaceError::Multiple(all_cancelled).is_cancellation());

        let mixed: ErrorList = vec![
            NomadSpaceError::Cancelled,
            NomadSpaceError::Engine("boom".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(!NomadSpaceError::Multiple(mixed).is_cancellation());
    }

    #[test]
    fn test_submit_error_mentions_file_and_job() {
        let err = NomadSpaceError::Submit {
            file: "svc.json".to_string(),
            job_id: "abc-svc".to_string(),
            source: Box::new(NomadSpaceError::Api {
                status: 500,
                body: "boom".to_string(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("svc.json"));
        assert!(msg.contains("abc-svc"));
        assert!(msg.contains("boom"));
    }
}
