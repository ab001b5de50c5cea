//! Error taxonomy for recording and publishing.
//!
//! Every failure maps onto one of three things the user can do about it
//! (see [`UserAction`]): try again, grant a permission, or nothing at all
//! because the data was already cleaned up.

use thiserror::Error;

use crate::session::SessionState;

/// Errors produced by the capture and publish pipeline.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Foreground or background location access was declined.
    #[error("location permission denied (foreground and background access are required)")]
    PermissionDenied,

    /// The recording captured too few points to form a route and was discarded.
    #[error(
        "insufficient GPS signal: captured {captured} point(s), need at least 2. \
         Check that location access is set to \"Always\" so tracking continues in the background"
    )]
    InsufficientSignal { captured: usize },

    /// The operation is not valid in the current session state.
    #[error("recording session is busy ({0:?})")]
    SessionBusy(SessionState),

    /// Local durable storage failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A persisted record could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// The backend could not be reached.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The backend refused the request.
    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    /// No signed-in user to attribute the drive to.
    #[error("not signed in")]
    NotSignedIn,

    #[error("invalid input: {0}")]
    Invalid(#[from] ValidationError),

    /// A photo could not be read or compressed.
    #[error("photo processing failed: {0}")]
    Photo(String),
}

/// Input validation failures, rejected before any storage or network activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a title is required")]
    MissingTitle,
    #[error("title must be no more than {max} characters")]
    TitleTooLong { max: usize },
    #[error("at least one photo is required")]
    NoPhotos,
    #[error("cannot exceed {max} photos")]
    TooManyPhotos { max: usize },
    #[error("description must be no more than {max} characters")]
    DescriptionTooLong { max: usize },
    #[error("rating must be between 0 and 5, got {0}")]
    RatingOutOfRange(u8),
    #[error("cannot exceed {max} tags")]
    TooManyTags { max: usize },
    #[error("stop {index} needs a name")]
    StopNameMissing { index: usize },
    #[error("stop {index} name must be no more than {max} characters")]
    StopNameTooLong { index: usize, max: usize },
    #[error("stop {index} description must be no more than {max} characters")]
    StopDescriptionTooLong { index: usize, max: usize },
}

/// What the user can do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Transient; retrying later may succeed.
    TryAgain,
    /// Configuration; the user must grant location access in settings.
    GrantPermission,
    /// Nothing to retry; the data has already been cleaned up.
    NothingToRetry,
    /// The entered metadata needs fixing.
    FixInput,
}

impl CaptureError {
    /// Map this error onto the action the user should take.
    pub fn user_action(&self) -> UserAction {
        match self {
            CaptureError::PermissionDenied => UserAction::GrantPermission,
            CaptureError::InsufficientSignal { .. } => UserAction::NothingToRetry,
            CaptureError::Invalid(_) => UserAction::FixInput,
            CaptureError::SessionBusy(_)
            | CaptureError::Storage(_)
            | CaptureError::Serialization(_)
            | CaptureError::NetworkUnavailable(_)
            | CaptureError::BackendRejected(_)
            | CaptureError::NotSignedIn
            | CaptureError::Photo(_) => UserAction::TryAgain,
        }
    }

    /// True if the failure was caused by missing connectivity.
    pub fn is_network(&self) -> bool {
        matches!(self, CaptureError::NetworkUnavailable(_))
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(e: serde_json::Error) -> Self {
        CaptureError::Serialization(e.to_string())
    }
}
