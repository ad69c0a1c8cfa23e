//! Sideload: device-side state for the sideloading agent
//!
//! Two pieces of state live on the device and are shared by every operator
//! connection:
//!
//! - [`FileStore`] - the sandbox directory that synchronized files are
//!   pushed into, listed from and deleted from.
//! - [`ProcessManager`] - the single managed application process, started
//!   from an entrypoint script found in the sandbox (or in the default
//!   install directory) and stopped on request.
//!
//! Neither component knows anything about the network; see the
//! `sideload-agent` crate for the secure listener and request routing.

mod process;
mod store;

pub use process::{
    ApplicationStatus, Entrypoints, LauncherKind, Launchers, PYTHON_ENTRYPOINT, ProcessError,
    ProcessManager, SHELL_ENTRYPOINT,
};
pub use store::{
    FileRecord, FileStore, RelativePath, StoreError, format_timestamp, parse_timestamp,
};
