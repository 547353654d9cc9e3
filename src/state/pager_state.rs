/// Pager and session state definitions
///
/// The cursor pager is a small state machine; a session ends with exactly one
/// termination reason recorded in its summary.
use std::fmt;

/// Current state of a [`crate::crawler::CursorPager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagerState {
    // ===== Active States =====
    /// No page has been requested yet
    Start,

    /// A page request is in flight
    FetchingPage,

    /// A page was emitted and the next cursor is known
    HasCursor,

    // ===== Terminal States =====
    /// Pagination ended cleanly
    Exhausted,

    /// Pagination ended because a page could not be fetched
    Error,
}

impl PagerState {
    /// Returns true if the pager will not issue further requests
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Error)
    }
}

impl fmt::Display for PagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::FetchingPage => "fetching_page",
            Self::HasCursor => "has_cursor",
            Self::Exhausted => "exhausted",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Why a crawl session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// The index had no more pages
    Exhausted,

    /// The index returned the cursor it was called with
    NoProgress,

    /// A page body had an unexpected shape; treated as end of data
    ProtocolError,

    /// A page could not be fetched after all retries
    FetchError,

    /// The cancellation token was raised
    Cancelled,

    /// `max-total-items` records were seen
    LimitReached,

    /// The sink reported a structural failure and the batch was aborted
    SinkFatal,
}

impl TerminationReason {
    /// Returns true if the session ended without a failure
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            Self::Exhausted | Self::NoProgress | Self::ProtocolError | Self::LimitReached
        )
    }

    /// Returns true if a later run should pick up from the checkpoint
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            Self::Exhausted | Self::NoProgress | Self::ProtocolError
        )
    }

    /// Converts the reason to its database / summary string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::NoProgress => "no-progress",
            Self::ProtocolError => "protocol-error",
            Self::FetchError => "fetch-error",
            Self::Cancelled => "cancelled",
            Self::LimitReached => "limit-reached",
            Self::SinkFatal => "sink-fatal",
        }
    }

    /// Parses a reason from its database string
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "exhausted" => Some(Self::Exhausted),
            "no-progress" => Some(Self::NoProgress),
            "protocol-error" => Some(Self::ProtocolError),
            "fetch-error" => Some(Self::FetchError),
            "cancelled" => Some(Self::Cancelled),
            "limit-reached" => Some(Self::LimitReached),
            "sink-fatal" => Some(Self::SinkFatal),
            _ => None,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
