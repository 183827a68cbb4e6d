//! Error types and result definitions for change stream operations.
//!
//! [`StreamError`] carries a classification ([`ErrorKind`]), a static description, optional
//! detail, the shard and last delivered resume token the failure relates to, and the callsite
//! it was raised at. Failures of several participants aggregate into a single error.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use cluster::{ClusterError, ShardId};

use crate::token::ResumeToken;

/// Result type of fallible change stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    shard: Option<ShardId>,
    last_token: Option<ResumeToken>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Error type of the change stream library.
#[derive(Debug, Clone)]
pub struct StreamError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(Box<ErrorPayload>),
    /// Failures collected from several participants.
    Many {
        errors: Vec<StreamError>,
        location: &'static Location<'static>,
    },
}

/// How a failure affects the stream that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Retried with backoff and only surfaced once retries are exhausted.
    Transient,
    /// The stream cannot continue and cannot be resumed from its last position.
    NonResumableFatal,
    /// The request was rejected before any event was produced.
    CallerError,
    /// The stream was cancelled by its consumer.
    Cancelled,
    Internal,
}

/// Classification of change stream errors.
///
/// Every kind maps to a stable numeric code returned by [`ErrorKind::code`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Caller errors
    InvalidOptions,
    MalformedResumeToken,
    InvalidResumeToken,
    UnsupportedOption,
    CursorAlreadyClosed,
    ConfigError,

    // Transient errors
    ShardUnavailable,
    TopologyUnavailable,

    // Non-resumable errors
    ShardRemoved,
    ChangeStreamHistoryLost,
    StreamStalled,

    Cancelled,

    // Internal errors
    InvalidState,
    SourceError,
    ParticipantPanic,
    SerializationError,
    DeserializationError,
    IoError,
    Unknown,

    // Used by fault injection to raise an error that is never retried.
    #[cfg(feature = "failpoints")]
    WithNoRetry,
}

impl ErrorKind {
    /// Stable numeric code of this kind.
    ///
    /// | code | kind |
    /// |------|------|
    /// | 1 | `InvalidOptions` |
    /// | 2 | `MalformedResumeToken` |
    /// | 3 | `InvalidResumeToken` (`resumeAfter` given an invalidation token) |
    /// | 4 | `UnsupportedOption` |
    /// | 5 | `CursorAlreadyClosed` |
    /// | 6 | `ConfigError` |
    /// | 20 | `ShardUnavailable` |
    /// | 21 | `TopologyUnavailable` |
    /// | 30 | `ShardRemoved` |
    /// | 31 | `ChangeStreamHistoryLost` |
    /// | 32 | `StreamStalled` |
    /// | 40 | `Cancelled` |
    /// | 50..=55 | internal errors |
    /// | 99 | `Unknown` |
    pub const fn code(&self) -> u32 {
        match self {
            ErrorKind::InvalidOptions => 1,
            ErrorKind::MalformedResumeToken => 2,
            ErrorKind::InvalidResumeToken => 3,
            ErrorKind::UnsupportedOption => 4,
            ErrorKind::CursorAlreadyClosed => 5,
            ErrorKind::ConfigError => 6,
            ErrorKind::ShardUnavailable => 20,
            ErrorKind::TopologyUnavailable => 21,
            ErrorKind::ShardRemoved => 30,
            ErrorKind::ChangeStreamHistoryLost => 31,
            ErrorKind::StreamStalled => 32,
            ErrorKind::Cancelled => 40,
            ErrorKind::InvalidState => 50,
            ErrorKind::SourceError => 51,
            ErrorKind::ParticipantPanic => 52,
            ErrorKind::SerializationError => 53,
            ErrorKind::DeserializationError => 54,
            ErrorKind::IoError => 55,
            ErrorKind::Unknown => 99,
            #[cfg(feature = "failpoints")]
            ErrorKind::WithNoRetry => 900,
        }
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidOptions
            | ErrorKind::MalformedResumeToken
            | ErrorKind::InvalidResumeToken
            | ErrorKind::UnsupportedOption
            | ErrorKind::CursorAlreadyClosed
            | ErrorKind::ConfigError => ErrorCategory::CallerError,
            ErrorKind::ShardUnavailable | ErrorKind::TopologyUnavailable => {
                ErrorCategory::Transient
            }
            ErrorKind::ShardRemoved
            | ErrorKind::ChangeStreamHistoryLost
            | ErrorKind::StreamStalled => ErrorCategory::NonResumableFatal,
            ErrorKind::Cancelled => ErrorCategory::Cancelled,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns `true` if an operation failing with this kind may succeed when retried.
    pub const fn is_transient(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

impl StreamError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`].
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Shortcut for `self.kind().code()`.
    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Shard the failure relates to, if known.
    pub fn shard(&self) -> Option<&ShardId> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.shard.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.shard()),
        }
    }

    /// Last resume token delivered by the stream before the failure.
    pub fn last_token(&self) -> Option<&ResumeToken> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.last_token.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.last_token()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Records the shard the error relates to unless one is already set.
    pub fn with_shard(mut self, shard: &ShardId) -> Self {
        match self.repr {
            ErrorRepr::Single(ref mut payload) => {
                payload.shard.get_or_insert_with(|| shard.clone());
            }
            ErrorRepr::Many { ref mut errors, .. } => {
                for error in errors.iter_mut() {
                    *error = error.clone().with_shard(shard);
                }
            }
        }
        self
    }

    /// Records the last delivered resume token unless one is already set.
    pub fn with_last_token(mut self, token: Option<&ResumeToken>) -> Self {
        let Some(token) = token else {
            return self;
        };

        match self.repr {
            ErrorRepr::Single(ref mut payload) => {
                payload.last_token.get_or_insert_with(|| token.clone());
            }
            ErrorRepr::Many { ref mut errors, .. } => {
                for error in errors.iter_mut() {
                    *error = error.clone().with_last_token(Some(token));
                }
            }
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        StreamError {
            repr: ErrorRepr::Single(Box::new(ErrorPayload {
                kind,
                description,
                detail,
                shard: None,
                last_token: None,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            })),
        }
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &StreamError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for StreamError {
    /// Hashes the kind and static description only, so repeated occurrences of the same
    /// failure group together regardless of detail or location.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}:{}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.kind.code(),
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(shard) = &payload.shard {
                    write!(f, "\n  Shard: {shard}")?;
                }
                if let Some(token) = &payload.last_token {
                    write!(f, "\n  Last resume token: {token}")?;
                }
                write_block("Detail", payload.detail.as_deref(), f)?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_block("Backtrace", Some(&backtrace), f)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for StreamError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes an indented, titled block. `None` writes nothing.
fn write_block(title: &str, content: Option<&str>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(content) = content else {
        return Ok(());
    };

    if content.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in content.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for StreamError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> StreamError {
        StreamError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for StreamError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> StreamError {
        StreamError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for StreamError
where
    E: Into<StreamError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> StreamError {
        let location = Location::caller();
        let mut errors: Vec<StreamError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        StreamError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<ClusterError> for StreamError {
    #[track_caller]
    fn from(err: ClusterError) -> StreamError {
        let (kind, description, shard) = match &err {
            ClusterError::ShardUnavailable(shard) => (
                ErrorKind::ShardUnavailable,
                "Shard is unavailable",
                Some(shard.clone()),
            ),
            ClusterError::ShardNotFound(shard) => (
                ErrorKind::ShardRemoved,
                "Resume point references a removed shard",
                Some(shard.clone()),
            ),
            ClusterError::HistoryLost { shard, .. } => (
                ErrorKind::ChangeStreamHistoryLost,
                "Resume point is no longer in the shard's write log",
                Some(shard.clone()),
            ),
            ClusterError::InvalidNamespace(_) => {
                (ErrorKind::InvalidOptions, "Invalid namespace", None)
            }
            _ => (ErrorKind::SourceError, "Cluster operation failed", None),
        };

        let detail = err.to_string();
        let error = StreamError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        );

        match shard {
            Some(shard) => error.with_shard(&shard),
            None => error,
        }
    }
}

impl From<config::shared::ValidationError> for StreamError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> StreamError {
        let detail = err.to_string();
        StreamError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::LoadConfigError> for StreamError {
    #[track_caller]
    fn from(err: config::LoadConfigError) -> StreamError {
        let detail = err.to_string();
        StreamError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Loading configuration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for StreamError {
    #[track_caller]
    fn from(err: serde_json::Error) -> StreamError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        StreamError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::io::Error> for StreamError {
    #[track_caller]
    fn from(err: std::io::Error) -> StreamError {
        let detail = err.to_string();
        StreamError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<tokio::task::JoinError> for StreamError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> StreamError {
        let kind = if err.is_cancelled() {
            ErrorKind::Cancelled
        } else {
            ErrorKind::ParticipantPanic
        };

        let detail = err.to_string();
        StreamError::from_components(
            kind,
            Cow::Borrowed("Participant task terminated abnormally"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
