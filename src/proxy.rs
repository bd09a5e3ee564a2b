//! The external proxy process hosting a match.

use tracing::{debug, instrument};

use crate::{
    configuration::ProxyCommand,
    error::RunnerError,
    process::{create_process, ManagedProcess, Output},
};

/// The proxy hosting one match, listening on `address`.
#[derive(Debug)]
pub struct ProxyProcess {
    address: String,
    process: ManagedProcess,
}

impl ProxyProcess {
    /// Start the proxy so that it listens on `address` (`host:port`).
    #[instrument(skip(command))]
    pub fn start(command: &ProxyCommand, address: &str) -> Result<ProxyProcess, RunnerError> {
        let args = command.args_for(address);
        debug!(program = command.program, ?args, "starting proxy");
        let child = create_process(&command.program, &args, None, Output::Null)?;
        Ok(ProxyProcess {
            address: address.to_string(),
            process: ManagedProcess::new(format!("proxy {address}"), child),
        })
    }

    /// `host:port` the proxy listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn process(&self) -> &ManagedProcess {
        &self.process
    }

    /// Forcefully terminate the proxy. Returns `false` if it was already killed.
    pub fn kill(&self) -> bool {
        self.process.kill()
    }
}
