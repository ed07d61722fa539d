//! Spawning the isolated copy of the application.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{OnceCell, oneshot, watch};

use crate::callback::{CallbackLink, CallbackServer};
use crate::config::ForkConfig;
use crate::logging;
use crate::remap::{
    ENV_CALLBACK_PORT, ENV_DEBUG_PORT, ENV_PORT_REMAP, ENV_SESSION_ID, RemapTable,
};

/// Everything the child needs to know. Built once per start.
#[derive(Debug, Clone)]
pub struct ForkSpec {
    pub session_id: String,
    pub remap: RemapTable,
    pub debug_port: u16,
    pub callback_port: u16,
}

impl ForkSpec {
    /// Environment injected into the child
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_PORT_REMAP, self.remap.encode()),
            (ENV_DEBUG_PORT, self.debug_port.to_string()),
            (ENV_CALLBACK_PORT, self.callback_port.to_string()),
            (ENV_SESSION_ID, self.session_id.clone()),
        ]
    }

    /// Every port the fork occupies, reassigned ports first
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.remap.iter().map(|(_, new)| new).collect();
        ports.push(self.debug_port);
        ports.push(self.callback_port);
        ports
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    /// Exit code, `None` when terminated by a signal
    Exited(Option<i32>),
}

/// Wait until the state channel reports an exit
pub async fn wait_for_exit(rx: &mut watch::Receiver<ChildState>) -> Option<i32> {
    loop {
        if let ChildState::Exited(code) = *rx.borrow_and_update() {
            return code;
        }
        if rx.changed().await.is_err() {
            return match *rx.borrow() {
                ChildState::Exited(code) => code,
                ChildState::Running => None,
            };
        }
    }
}

/// Handle to a running forked process
#[async_trait]
pub trait ForkedChild: Send + Sync {
    fn pid(&self) -> u32;

    /// Send the kill signal. Returns `true` only for the call that sent it.
    fn kill(&self) -> bool;

    fn state(&self) -> ChildState;

    fn has_exited(&self) -> bool {
        matches!(self.state(), ChildState::Exited(_))
    }

    /// Subscribe to lifecycle changes
    fn watch_exit(&self) -> watch::Receiver<ChildState>;

    async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.watch_exit();
        wait_for_exit(&mut rx).await
    }

    /// Push session state through the callback channel and wait for the ack
    async fn push_session(&self, data: Value, timeout: Duration) -> Result<()>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &ForkSpec) -> Result<Arc<dyn ForkedChild>>;
}

/// Launches the configured command as a real OS process
pub struct ProcessLauncher {
    config: ForkConfig,
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(config: ForkConfig) -> Self {
        Self {
            config,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn program_and_args(&self, spec: &ForkSpec) -> Result<(String, Vec<String>)> {
        let program = match &self.config.command {
            Some(cmd) => cmd.clone(),
            None => std::env::current_exe()
                .context("Cannot determine current executable")?
                .to_string_lossy()
                .into_owned(),
        };
        let args: Vec<String> = match &self.config.args {
            Some(args) => args.clone(),
            None => std::env::args().skip(1).collect(),
        };
        let args = args
            .iter()
            .map(|arg| substitute_placeholders(arg, spec))
            .collect();
        Ok((program, args))
    }
}

pub fn substitute_placeholders(arg: &str, spec: &ForkSpec) -> String {
    arg.replace("{debug_port}", &spec.debug_port.to_string())
        .replace("{callback_port}", &spec.callback_port.to_string())
        .replace("{session_id}", &spec.session_id)
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &ForkSpec) -> Result<Arc<dyn ForkedChild>> {
        let server = CallbackServer::bind(spec.callback_port).await?;
        let (program, args) = self.program_and_args(spec)?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn forked process: {}", program))?;
        let pid = child.id().context("Forked process has no pid")?;
        logging::info(&format!(
            "Spawned forked process pid={} debug_port={} callback_port={}",
            pid, spec.debug_port, spec.callback_port
        ));

        let link: Arc<OnceCell<CallbackLink>> = Arc::new(OnceCell::new());
        let mut ready_task = None;

        if self.config.wait_for_ready {
            let timeout = self.config.ready_timeout();
            let ready = tokio::select! {
                accepted = tokio::time::timeout(timeout, server.accept_ready()) => match accepted {
                    Ok(Ok(ready)) => Ok(ready),
                    Ok(Err(e)) => Err(e.context("Callback channel failed")),
                    Err(_) => Err(anyhow::anyhow!(
                        "Forked process not ready within {}s",
                        timeout.as_secs()
                    )),
                },
                status = child.wait() => Err(match status {
                    Ok(status) => anyhow::anyhow!("Forked process exited early ({})", status),
                    Err(e) => anyhow::anyhow!("Failed waiting on forked process: {}", e),
                }),
            };

            match ready {
                Ok((callback, reported_pid)) => {
                    if reported_pid != pid {
                        logging::debug(&format!(
                            "Ready from pid {} (spawned pid {})",
                            reported_pid, pid
                        ));
                    }
                    let _ = link.set(callback);
                }
                Err(e) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(e);
                }
            }
        } else {
            let link = Arc::clone(&link);
            ready_task = Some(tokio::spawn(async move {
                if let Ok((callback, _)) = server.accept_ready().await {
                    let _ = link.set(callback);
                }
            }));
        }

        let (state_tx, state_rx) = watch::channel(ChildState::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            logging::info(&format!("Forked process pid={} exited code={:?}", pid, code));
            // Frees the callback port before it goes back to the allocator
            if let Some(task) = ready_task {
                task.abort();
                let _ = task.await;
            }
            let _ = state_tx.send(ChildState::Exited(code));
        });

        Ok(Arc::new(OsChild {
            pid,
            kill_sent: AtomicBool::new(false),
            kill_tx: Mutex::new(Some(kill_tx)),
            state_rx,
            link,
        }))
    }
}

struct OsChild {
    pid: u32,
    kill_sent: AtomicBool,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    state_rx: watch::Receiver<ChildState>,
    link: Arc<OnceCell<CallbackLink>>,
}

#[async_trait]
impl ForkedChild for OsChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&self) -> bool {
        if self.kill_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let sender = self.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        logging::info(&format!("Kill sent to forked process pid={}", self.pid));
        true
    }

    fn state(&self) -> ChildState {
        *self.state_rx.borrow()
    }

    fn watch_exit(&self) -> watch::Receiver<ChildState> {
        self.state_rx.clone()
    }

    async fn push_session(&self, data: Value, timeout: Duration) -> Result<()> {
        let link = self
            .link
            .get()
            .context("Forked process has not connected to the callback port")?;
        link.push_session(data, timeout).await
    }
}
