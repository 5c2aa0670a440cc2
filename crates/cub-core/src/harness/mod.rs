//! Harness adapter interface for external coding assistants.
//!
//! Defines the [`Harness`] trait every adapter implements, its request/
//! result types ([`InvokeRequest`], [`InvokeResult`], [`ErrorCategory`]),
//! and the [`HarnessRegistry`] used for name-based lookup.
//!
//! ```text
//! run loop
//!     |
//!     v
//! HarnessRegistry --get("claude")--> &dyn Harness
//!                                         |
//!                                    invoke(request)
//!                                         |
//!                                         v
//!                                  InvokeResult { success, tokens, cost, ... }
//! ```

pub mod claude;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use claude::ClaudeHarness;
pub use registry::HarnessRegistry;
pub use trait_def::Harness;
pub use types::{ErrorCategory, InvokeRequest, InvokeResult, StdinMode};
