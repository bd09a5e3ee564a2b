//! Errors raised while launching bots and driving the proxy protocol.

use std::{io, path::PathBuf, time::Duration};

use crate::bot::{HostOs, RuntimeType};

/// Everything that can end a match early.
///
/// Each error is local to the match that produced it: the scheduler turns it into an
/// [`Outcome::Error`](crate::result::Outcome::Error) result and carries on with the batch.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The bot install directory does not exist.
    #[error("bot folder '{}' does not exist", .0.display())]
    FolderNotFound(PathBuf),

    /// No marker file of the runtime table was found in the install directory.
    #[error("could not deduce the runtime of bot '{name}' from '{}'", .dir.display())]
    UnrecognizedRuntime {
        /// Bot name.
        name: String,
        /// Directory that was scanned.
        dir: PathBuf,
    },

    /// The runtime cannot be launched on this host.
    #[error("bot '{name}' ({runtime}) cannot be launched on {os}")]
    UnsupportedPlatform {
        /// Bot name.
        name: String,
        /// Deduced runtime.
        runtime: RuntimeType,
        /// Host the launch was attempted on.
        os: HostOs,
    },

    /// Spawning the process failed.
    #[error("could not launch '{program}'")]
    LaunchFailed {
        /// Program that failed to spawn.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `start` was called on a process that is still running.
    #[error("'{0}' is already running")]
    AlreadyStarted(String),

    /// Protocol violation or unexpected closure of the proxy socket.
    #[error("proxy connection error: {0}")]
    Connection(String),

    /// A bot did not connect to the proxy in time.
    #[error("bot did not connect within {0:?}")]
    AckTimeout(Duration),

    /// The port reservation service could not provide a port.
    #[error("could not reserve a port")]
    PortReservation(#[source] io::Error),
}
