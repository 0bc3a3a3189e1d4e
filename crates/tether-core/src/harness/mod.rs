//! Harness adapter interface for coding agents.
//!
//! This module defines the [`Harness`] trait that all agent adapters
//! implement, the [`HarnessRegistry`] for runtime lookup, and
//! [`CursorAdapter`], which drives the `cursor-agent` CLI.
//!
//! # Architecture
//!
//! ```text
//! Client
//!     |
//!     v
//! HarnessRegistry --get("cursor")--> &dyn Harness
//!     |                                  |
//!     |   connect() ---------------------+--> verify binary/auth, start HookServer,
//!     |                                  |    install hooks, forward signals
//!     |   new_session(cwd) -> SessionInfo
//!     |   set_session_model(id, model)
//!     |   prompt(request) -> PromptResponse { stop_reason }
//!     |        |
//!     |        +--> ProcessConnection --> StreamParser --> EventTranslator
//!     |                                                        |
//!     |                              HarnessEvent channel <----+
//!     |   disconnect()
//! ```

pub mod cursor;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use cursor::{CURSOR_HARNESS_NAME, CursorAdapter};
pub use registry::HarnessRegistry;
pub use trait_def::Harness;
pub use types::{
    HarnessError, HarnessEvent, HarnessStatus, PromptRequest, PromptResponse, SessionInfo,
};
