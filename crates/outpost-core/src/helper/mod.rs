//! User-session helper: connects to the service broker and performs
//! desktop-bound work on its behalf.

pub mod actions;
pub mod client;

pub use actions::{HelperActions, LocalHelperActions, detect_display_env};
pub use client::{HelperClient, auth_request};
