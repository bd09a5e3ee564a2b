//! Bot runtime deduction and process lifecycle.
//!
//! A bot lives in `<bot_directory>/<name>/` and is recognised by a marker file:
//!
//! | marker          | runtime                        |
//! |-----------------|--------------------------------|
//! | `run.py`        | [`RuntimeType::Interpreted`]   |
//! | `<name>.exe`    | [`RuntimeType::NativeWindows`] |
//! | `<name>`        | [`RuntimeType::NativeLinux`]   |
//! | `<name>.dll`    | [`RuntimeType::ManagedDotnet`] |
//! | `<name>.jar`    | [`RuntimeType::ManagedJava`]   |
//!
//! When several markers are present, the first one of this table is used.
//!
//! Bots are started with `--GamePort <port> --StartPort <port> --LadderServer <host>
//! --OpponentId <id>`, from their own directory, with stdout and stderr written to
//! `data/stderr.log`.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tracing::{debug, instrument, trace, warn};

use crate::{
    configuration::Launchers,
    error::RunnerError,
    process::{create_process, ManagedProcess, Output},
};

/// How a bot has to be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeType {
    /// `run.py` started by a Python interpreter.
    Interpreted,
    /// Linux executable named after the bot.
    NativeLinux,
    /// `<name>.exe`, run natively on Windows or through a compatibility layer on Linux.
    NativeWindows,
    /// `<name>.dll` started by the .NET runtime.
    ManagedDotnet,
    /// `<name>.jar` started by the Java runtime.
    ManagedJava,
}

impl RuntimeType {
    const ALL: [RuntimeType; 5] = [
        RuntimeType::Interpreted,
        RuntimeType::NativeWindows,
        RuntimeType::NativeLinux,
        RuntimeType::ManagedDotnet,
        RuntimeType::ManagedJava,
    ];

    /// File whose presence identifies this runtime.
    pub fn marker(self, bot_name: &str) -> String {
        match self {
            RuntimeType::Interpreted => "run.py".to_string(),
            RuntimeType::NativeWindows => format!("{bot_name}.exe"),
            RuntimeType::NativeLinux => bot_name.to_string(),
            RuntimeType::ManagedDotnet => format!("{bot_name}.dll"),
            RuntimeType::ManagedJava => format!("{bot_name}.jar"),
        }
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeType::Interpreted => "python",
            RuntimeType::NativeLinux => "cpplinux",
            RuntimeType::NativeWindows => "cppwin32",
            RuntimeType::ManagedDotnet => "dotnetcore",
            RuntimeType::ManagedJava => "java",
        };
        f.write_str(name)
    }
}

/// Operating system the runner executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    /// Linux and other Unix-likes.
    Linux,
    /// Windows.
    Windows,
    /// macOS.
    MacOs,
}

impl HostOs {
    /// The OS this binary was built for.
    pub fn current() -> HostOs {
        if cfg!(windows) {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else {
            HostOs::Linux
        }
    }
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Program and arguments, before the ladder flags are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program to execute.
    pub program: String,
    /// Arguments preceding the ladder flags.
    pub args: Vec<String>,
}

/// Command used to launch a bot of `runtime` on `os`.
///
/// Every (runtime, OS) pair is listed; the unsupported ones return `None`.
pub fn command_template(
    runtime: RuntimeType,
    os: HostOs,
    bot_name: &str,
    bot_dir: &Path,
    launchers: &Launchers,
) -> Option<CommandLine> {
    use HostOs::*;
    use RuntimeType::*;

    let marker = runtime.marker(bot_name);
    let in_dir = bot_dir.join(&marker).to_string_lossy().into_owned();
    let via = |launcher: &str, args: Vec<String>| CommandLine {
        program: launcher.to_string(),
        args,
    };

    let command = match (runtime, os) {
        (Interpreted, Linux | Windows | MacOs) => via(&launchers.python, vec![marker]),
        (NativeWindows, Linux) => via(&launchers.wine, vec![in_dir]),
        (NativeWindows, Windows) => via(&in_dir, vec![]),
        (NativeWindows, MacOs) => return None,
        (NativeLinux, Linux) => via(&in_dir, vec![]),
        (NativeLinux, Windows | MacOs) => return None,
        (ManagedDotnet, Linux | Windows | MacOs) => via(&launchers.dotnet, vec![marker]),
        (ManagedJava, Linux | Windows | MacOs) => {
            via(&launchers.java, vec!["-jar".to_string(), marker])
        }
    };
    Some(command)
}

/// Flags every bot receives.
pub fn ladder_args(port: u16, host: &str, opponent_id: &str) -> Vec<String> {
    vec![
        "--GamePort".to_string(),
        port.to_string(),
        "--StartPort".to_string(),
        port.to_string(),
        "--LadderServer".to_string(),
        host.to_string(),
        "--OpponentId".to_string(),
        opponent_id.to_string(),
    ]
}

/// Deduce the runtime of bot `name` installed in `bot_dir`.
///
/// # Errors
/// [`RunnerError::FolderNotFound`] when `bot_dir` does not exist,
/// [`RunnerError::UnrecognizedRuntime`] when no marker file is present.
#[instrument]
pub fn deduce_runtime(bot_dir: &Path, name: &str) -> Result<RuntimeType, RunnerError> {
    if !bot_dir.is_dir() {
        return Err(RunnerError::FolderNotFound(bot_dir.to_path_buf()));
    }

    let found: Vec<RuntimeType> = RuntimeType::ALL
        .into_iter()
        .filter(|runtime| bot_dir.join(runtime.marker(name)).is_file())
        .collect();

    match found.as_slice() {
        [] => Err(RunnerError::UnrecognizedRuntime {
            name: name.to_string(),
            dir: bot_dir.to_path_buf(),
        }),
        [runtime] => Ok(*runtime),
        [runtime, ..] => {
            warn!("several marker files found for '{name}' ({found:?}), using {runtime}");
            Ok(*runtime)
        }
    }
}

/// One bot of a match.
#[derive(Debug)]
pub struct BotProcess {
    name: String,
    directory: PathBuf,
    runtime: RuntimeType,
    process: Option<ManagedProcess>,
}

impl BotProcess {
    /// Locate bot `name` in `bot_directory` and deduce its runtime.
    pub fn new(name: &str, bot_directory: &Path) -> Result<BotProcess, RunnerError> {
        let directory = bot_directory.join(name);
        let runtime = deduce_runtime(&directory, name)?;
        Ok(Self::with_runtime(name, directory, runtime))
    }

    /// Bot with an explicit runtime, `directory` being the bot's own install directory.
    pub fn with_runtime(name: &str, directory: PathBuf, runtime: RuntimeType) -> BotProcess {
        BotProcess {
            name: name.to_string(),
            directory,
            runtime,
            process: None,
        }
    }

    /// Bot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deduced runtime.
    pub fn runtime(&self) -> RuntimeType {
        self.runtime
    }

    /// Install directory of the bot.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Running process, if any.
    pub fn process(&self) -> Option<&ManagedProcess> {
        self.process.as_ref()
    }

    /// Full command line for this host.
    pub fn command_line(
        &self,
        os: HostOs,
        launchers: &Launchers,
        opponent_id: &str,
        port: u16,
        host: &str,
    ) -> Result<CommandLine, RunnerError> {
        let mut command = command_template(self.runtime, os, &self.name, &self.directory, launchers)
            .ok_or_else(|| RunnerError::UnsupportedPlatform {
                name: self.name.clone(),
                runtime: self.runtime,
                os,
            })?;
        command.args.extend(ladder_args(port, host, opponent_id));
        Ok(command)
    }

    /// Launch the bot against `opponent_id` on the proxy at `host:port`.
    ///
    /// # Errors
    /// [`RunnerError::AlreadyStarted`] if the bot is running,
    /// [`RunnerError::UnsupportedPlatform`] if the runtime cannot run here,
    /// [`RunnerError::LaunchFailed`] if the process could not be spawned.
    #[instrument(skip(self, launchers), fields(bot = self.name, runtime = %self.runtime))]
    pub fn start(
        &mut self,
        launchers: &Launchers,
        opponent_id: &str,
        port: u16,
        host: &str,
    ) -> Result<&ManagedProcess, RunnerError> {
        if self.process.is_some() {
            return Err(RunnerError::AlreadyStarted(self.name.clone()));
        }

        let command = self.command_line(HostOs::current(), launchers, opponent_id, port, host)?;
        debug!(program = command.program, args = ?command.args, "starting bot");

        let data_dir = self.directory.join("data");
        std::fs::create_dir_all(&data_dir).map_err(|source| RunnerError::LaunchFailed {
            program: command.program.clone(),
            source,
        })?;
        let child = create_process(
            &command.program,
            &command.args,
            Some(&self.directory),
            Output::File(&data_dir.join("stderr.log")),
        )?;

        let process = self
            .process
            .insert(ManagedProcess::new(format!("bot {}", self.name), child));
        Ok(&*process)
    }

    /// Forcefully terminate the bot.
    ///
    /// Killing a bot that was never started, or that is already killed, does nothing and
    /// returns `false`. The bot may be started again afterwards.
    pub fn kill(&mut self) -> bool {
        match self.process.take() {
            Some(process) => process.kill(),
            None => {
                trace!("'{}' is not running, nothing to kill", self.name);
                false
            }
        }
    }
}
