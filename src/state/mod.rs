//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `PagerState`: the cursor pager's position in its state machine
//! - `TerminationReason`: why a session stopped

mod pager_state;

pub use pager_state::{PagerState, TerminationReason};
