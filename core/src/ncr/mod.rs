//! Host side engine for NCR 53C8xx SCRIPTS processors
//!
//! The chip runs a bound SCRIPTS program autonomously and talks to the host
//! only through a handful of registers, its interrupt and the control blocks
//! in shared memory. Each command travels through the host status byte of its
//! CCB:
//!
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> Idle
//!     Idle --> Busy: submit
//!     Idle --> Negotiate: submit with SDTR/WDTR
//!     Negotiate --> Busy: answer or fallback
//!     Busy --> Disconnect: target disconnects
//!     Negotiate --> Disconnect
//!     Disconnect --> Busy: reselection
//!     Busy --> Complete
//!     Busy --> SelTimeout
//!     Busy --> Unexpected
//!     Busy --> Aborted: abort, deadline
//!     Disconnect --> Aborted: abort, deadline
//!     Busy --> Reset: bus reset
//!     Disconnect --> Reset: bus reset
//!     Complete --> Idle: released
//!     SelTimeout --> Idle
//!     Unexpected --> Idle
//!     Aborted --> Idle
//!     Reset --> Idle
//! ```

pub mod adapter;
pub mod ccb;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod negotiation;
pub mod recovery;
pub mod regs;
pub mod script;
pub mod target;
pub mod usercmd;

pub use adapter::{Adapter, AdapterSnapshot, CompletionReceiver, CompletionSender, TagOrder};
pub use config::AdapterConfig;
pub use error::{BindError, ConfigError, SubmitError};
pub use lifecycle::{
    AbortOutcome, CommandId, CommandResult, Completion, DataSegment, ScsiCommand, Submitted,
};

/// Target ids on a wide bus
pub const MAX_TARGET: usize = 16;
/// Logical units addressed per target
pub const MAX_LUN: usize = 8;
/// Hard ceiling of outstanding tags per logical unit
pub const MAX_TAGS: usize = 32;
pub const MAX_START_LIMIT: usize = 64;
pub const MAX_SCATTER_LIMIT: usize = 64;
