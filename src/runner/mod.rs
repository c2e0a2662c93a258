//! Command execution behind a single contract.
//!
//! Two runners implement [`Runner`]:
//!
//! - [`ExecRunner`] starts real processes, optionally in their own process
//!   group, and reaps them from a background task so the hypervisor can keep
//!   running after the tool exits.
//! - [`InertRunner`] records (and optionally echoes) what would have been
//!   executed. It backs `--dry` and tests.
//!
//! Call sites are generic over `Runner` and never ask which one they hold.
//!
//! ```text
//! exec(program, args)
//!     └─► spawn (own pgid when detached)  →  Some(ProcessHandle { pid, detached })
//!             └─► reaper task: child.wait() → oneshot (prevents zombies only)
//! is_alive(handle)  →  kill(pid, 0)
//! stop(handle)      →  SIGTERM to pgid / pid, then bounded wait for exit
//! ```

mod exec;
mod handle;
mod inert;

pub use exec::ExecRunner;
pub use handle::{Attachment, ProcessHandle, StaleReason};
pub use inert::InertRunner;

use crate::error::Result;

#[allow(async_fn_in_trait)]
pub trait Runner {
    /// Configure whether subsequent `exec` calls start a new process group.
    fn set_detached(&mut self, detached: bool);

    /// Start `program` without waiting for it to finish. Returns the handle
    /// of the started process, or `None` when nothing was actually started.
    fn exec(&mut self, program: &str, args: &[String]) -> Result<Option<ProcessHandle>>;

    /// Run a short helper command to completion and return its combined
    /// stdout and stderr. A non-zero exit is an error.
    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;

    /// Whether the process behind `handle` still exists and is signalable.
    fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Gracefully terminate the process (or its group) behind `handle`.
    async fn stop(&mut self, handle: &ProcessHandle) -> Result<()>;
}

/// Render a command line for logs and error messages, skipping empty args.
pub fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
