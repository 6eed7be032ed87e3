//! Process supervision for the bootstrap-then-run container entrypoint.
//!
//! Optionally starts the secret store server as a child process, drives the
//! bootstrap controller to `Ready`, then starts the application with the
//! store address and the scoped token in its environment. The application's
//! exit status becomes the launcher's. Ctrl-c stops both children, but
//! only once a bootstrap in progress has finished.

use std::future::Future;
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::bootstrap::{BootstrapController, BootstrapReport};
use crate::errors::{Error, Phase, Result};
use crate::publisher::CredentialSource;

/// Environment variable carrying the store address to the application
pub const APP_ADDR_VAR: &str = "VAULT_ADDR";
/// Environment variable carrying the scoped token to the application
pub const APP_TOKEN_VAR: &str = "VAULT_TOKEN";

/// Exit code reported when the launcher is interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// Split an argv vector into program and arguments.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) =
            argv.split_first().ok_or_else(|| Error::config("command cannot be empty"))?;
        Ok(Self { program: program.clone(), args: args.to_vec() })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        command
    }

    fn spawn(&self, command: &mut Command) -> Result<Child> {
        command.spawn().map_err(|e| Error::io(format!("failed to start '{}'", self.program), e))
    }
}

/// Supervises the store server and the application around a bootstrap run.
#[derive(Debug)]
pub struct Launcher {
    store: Option<ProcessSpec>,
    app: ProcessSpec,
    store_address: String,
}

impl Launcher {
    pub fn new(store: Option<ProcessSpec>, app: ProcessSpec, store_address: impl Into<String>) -> Self {
        Self { store, app, store_address: store_address.into() }
    }

    /// Bootstrap, run the application, and return its exit code.
    pub async fn run(
        &self,
        controller: &BootstrapController,
        source: &CredentialSource,
    ) -> Result<i32> {
        self.run_until(controller, source, tokio::signal::ctrl_c()).await
    }

    /// [`run`](Self::run) with an arbitrary interrupt signal.
    ///
    /// An interrupt during bootstrap is held until the controller finishes:
    /// the sequence after `initialize` never stops halfway. The application
    /// is then not started.
    pub async fn run_until<F>(
        &self,
        controller: &BootstrapController,
        source: &CredentialSource,
        interrupt: F,
    ) -> Result<i32>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        let mut store_child = match &self.store {
            Some(spec) => {
                let child = spec.spawn(&mut spec.command())?;
                info!(program = %spec.program, pid = ?child.id(), "Started secret store process");
                Some(child)
            }
            None => None,
        };

        tokio::pin!(interrupt);
        let mut interrupted = false;

        let bootstrap = controller.run(source);
        tokio::pin!(bootstrap);
        let report = loop {
            tokio::select! {
                report = &mut bootstrap => break report?,
                status = wait_optional(&mut store_child) => {
                    let status = status.map_err(|e| Error::io("failed to wait for secret store process", e))?;
                    return Err(Error::unreachable(
                        &self.store_address,
                        format!("secret store process exited during bootstrap ({})", status),
                    )
                    .in_phase(Phase::WaitForStore));
                }
                _ = &mut interrupt, if !interrupted => {
                    warn!("Interrupt received; finishing bootstrap before stopping");
                    interrupted = true;
                }
            }
        };

        if interrupted {
            info!(path = ?report.path, "Bootstrap complete; not starting application");
            stop(&mut store_child, "secret store").await;
            return Ok(INTERRUPTED_EXIT_CODE);
        }

        let mut app = self.spawn_app(&report)?;
        info!(program = %self.app.program, pid = ?app.id(), "Started application");

        let code = tokio::select! {
            status = app.wait() => {
                let status = status.map_err(|e| Error::io("failed to wait for application", e))?;
                info!(status = %status, "Application exited");
                exit_code(status)
            }
            status = wait_optional(&mut store_child) => {
                error!(status = ?status.ok(), "Secret store process exited while the application was running");
                stop_child(&mut app, "application").await;
                1
            }
            _ = &mut interrupt => {
                warn!("Interrupted; stopping application");
                stop_child(&mut app, "application").await;
                INTERRUPTED_EXIT_CODE
            }
        };

        stop(&mut store_child, "secret store").await;
        Ok(code)
    }

    fn spawn_app(&self, report: &BootstrapReport) -> Result<Child> {
        let mut command = self.app.command();
        command
            .env(APP_ADDR_VAR, &self.store_address)
            .env(APP_TOKEN_VAR, report.app_token.expose_secret());
        self.app.spawn(&mut command)
    }
}

async fn wait_optional(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn stop(child: &mut Option<Child>, name: &str) {
    if let Some(child) = child {
        stop_child(child, name).await;
    }
}

async fn stop_child(child: &mut Child, name: &str) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.kill().await {
        warn!(process = name, error = %e, "Failed to stop child process");
    }
}

/// Exit code of a finished child; signals map to `128 + signal` on unix.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
