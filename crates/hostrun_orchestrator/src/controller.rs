//! Lifecycle of one host process instance: locate, launch, wait for
//! readiness, inject the agent, and tear down.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostrun_utils::net_protocol::agent::{
    HOSTRUN_AGENT_LOG, HOSTRUN_CHANNEL, HOSTRUN_CHANNEL_TOKEN, HOSTRUN_READY_FILE,
};
use hostrun_utils::timeout_future::TimeoutFuture;
use thiserror::Error;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::binding::{self, BindingOutcome, BindingStore};
use crate::debugger::{self, DebuggerAttach};
use crate::locator::HostLocator;
use crate::transport::{AcceptError, AgentChannel, ChannelTransport};

/// Grace period for a killed host to actually exit.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Bound on the throwaway first-run launch/shutdown cycle.
const THROWAWAY_GRACE: Duration = Duration::from_secs(30);

const DEBUG_ATTACH_ATTEMPTS: usize = 5;
const DEBUG_ATTACH_BASE_DELAY: Duration = Duration::from_millis(250);

/// "Run `entry_symbol` from `library` inside a foreign process": the
/// injection boundary this system depends on but does not implement.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub library: PathBuf,
    pub entry_symbol: String,
}

impl Default for BootstrapSpec {
    fn default() -> Self {
        Self {
            library: PathBuf::from("hostrun_agent"),
            entry_symbol: "hostrun_bootstrap".to_string(),
        }
    }
}

pub trait AgentInjector: Send + Sync {
    fn inject(&self, pid: u32, bootstrap: &BootstrapSpec) -> anyhow::Result<()>;
}

/// Injector relying on the launch-time environment contract: hosts that see
/// [HOSTRUN_CHANNEL] bootstrap the agent themselves, so there is nothing
/// left to do here. Real deployments substitute a platform injector.
pub struct EnvContractInjector;

impl AgentInjector for EnvContractInjector {
    fn inject(&self, _pid: u32, _bootstrap: &BootstrapSpec) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A freshly launched host process, as seen by readiness probes.
pub struct LaunchedHost {
    pub pid: u32,
    pub ready_file: PathBuf,
}

/// Capability answering the host's "is still initializing" signal.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn still_initializing(&self, host: &LaunchedHost) -> bool;
}

/// Default probe: the launch contract names a file the host touches once its
/// interactive startup is done.
pub struct ReadyFileProbe;

#[async_trait]
impl ReadinessProbe for ReadyFileProbe {
    async fn still_initializing(&self, host: &LaunchedHost) -> bool {
        !matches!(tokio::fs::try_exists(&host.ready_file).await, Ok(true))
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub version: String,
    pub profile: String,
    /// Command-line flag selecting the isolation profile.
    pub profile_flag: String,
    pub ready_poll_interval: Duration,
    /// Bound on one [HostController::connect] accept.
    pub accept_timeout: Duration,
    /// Extra environment for the launched host.
    pub extra_env: Vec<(String, String)>,
    /// Prefixes of ambient environment variables propagated to the host, so
    /// profiling/instrumentation tooling wrapping the orchestrator keeps
    /// seeing the child processes.
    pub instrumentation_env_prefixes: Vec<String>,
    /// Directory for the agent's in-host log file.
    pub agent_log_dir: Option<PathBuf>,
    /// Directories beyond the orchestrator's own to include in the host's
    /// probing configuration.
    pub extra_probing_paths: Vec<PathBuf>,
    pub bootstrap: BootstrapSpec,
}

impl HostConfig {
    pub fn new(version: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            profile: profile.into(),
            profile_flag: "--profile".to_string(),
            ready_poll_interval: Duration::from_millis(250),
            accept_timeout: Duration::from_secs(30),
            extra_env: Vec::new(),
            instrumentation_env_prefixes: vec![
                "PROFILER_".to_string(),
                "COVERAGE_".to_string(),
            ],
            agent_log_dir: None,
            extra_probing_paths: Vec::new(),
            bootstrap: BootstrapSpec::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("host process is not started")]
    NotStarted,
    #[error("{0}")]
    Accept(#[from] AcceptError),
}

/// Owner of one host process's start/stop lifecycle.
#[async_trait]
pub trait HostController: Send + Sync {
    /// "version/profile", for report messages.
    fn describe(&self) -> String;

    /// Brings a host process up to the point where the agent can be
    /// connected. Returns false (never errors) on the expected failure
    /// paths: executable not locatable, process never ready, injection
    /// failed. Readiness polling is unbounded here; callers wrap with their
    /// own timeout.
    async fn start(&mut self) -> bool;

    fn is_started(&self) -> bool;

    /// Accepts the injected agent's dial-back, yielding the remote proxy.
    async fn connect(&mut self) -> Result<Box<dyn AgentChannel>, ConnectError>;

    /// Best-effort teardown; every step individually guarded.
    async fn stop(&mut self);
}

struct RunningHost {
    child: Child,
    transport: ChannelTransport,
    ready_file: PathBuf,
}

pub struct ProcessHostController {
    config: HostConfig,
    locator: Arc<dyn HostLocator>,
    injector: Arc<dyn AgentInjector>,
    probe: Arc<dyn ReadinessProbe>,
    bindings: Arc<dyn BindingStore>,
    debugger: Option<Arc<dyn DebuggerAttach>>,
    running: Option<RunningHost>,
    bindings_ensured: bool,
}

impl ProcessHostController {
    pub fn new(
        config: HostConfig,
        locator: Arc<dyn HostLocator>,
        bindings: Arc<dyn BindingStore>,
    ) -> Self {
        Self {
            config,
            locator,
            injector: Arc::new(EnvContractInjector),
            probe: Arc::new(ReadyFileProbe),
            bindings,
            debugger: None,
            running: None,
            bindings_ensured: false,
        }
    }

    pub fn with_injector(mut self, injector: Arc<dyn AgentInjector>) -> Self {
        self.injector = injector;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn DebuggerAttach>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// One-time, idempotent per-(version, profile): make sure the host's
    /// probing configuration covers the orchestrator's dependency
    /// directories. The very first run for a pair needs one throwaway host
    /// launch/shutdown first; the host's configuration store is populated
    /// only after at least one run.
    async fn ensure_binding_paths(&mut self) -> std::io::Result<()> {
        let wanted = binding::dependency_dirs(&self.config.extra_probing_paths);

        match binding::reconcile(
            &*self.bindings,
            &self.config.version,
            &self.config.profile,
            &wanted,
        )? {
            BindingOutcome::Unchanged | BindingOutcome::Extended => Ok(()),
            BindingOutcome::FirstRun => {
                tracing::info!(
                    version = %self.config.version,
                    profile = %self.config.profile,
                    "first run for this version and profile; performing a throwaway launch"
                );
                self.throwaway_launch().await;
                self.bindings.save(
                    &self.config.version,
                    &self.config.profile,
                    &binding::BindingConfig {
                        probing_paths: wanted,
                    },
                )
            }
        }
    }

    async fn throwaway_launch(&self) {
        let Some(exe) = self.locator.locate(&self.config.version) else {
            return;
        };

        let mut cmd = Command::new(exe);
        if !self.config.profile.is_empty() {
            cmd.arg(&self.config.profile_flag).arg(&self.config.profile);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(%error, "throwaway launch failed to spawn");
                return;
            }
        };

        if TimeoutFuture::new(child.wait(), THROWAWAY_GRACE)
            .wait()
            .await
            .is_none()
        {
            let _ = child.start_kill();
            let _ = TimeoutFuture::new(child.wait(), KILL_GRACE).wait().await;
        }
    }

    fn ready_file_path() -> PathBuf {
        std::env::temp_dir().join(format!("hostrun-ready-{}", Uuid::new_v4()))
    }

    fn ambient_instrumentation_env(&self) -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(key, _)| {
                self.config
                    .instrumentation_env_prefixes
                    .iter()
                    .any(|prefix| key.starts_with(prefix))
            })
            .collect()
    }
}

#[async_trait]
impl HostController for ProcessHostController {
    fn describe(&self) -> String {
        if self.config.profile.is_empty() {
            self.config.version.clone()
        } else {
            format!("{}/{}", self.config.version, self.config.profile)
        }
    }

    async fn start(&mut self) -> bool {
        if self.running.is_some() {
            return true;
        }

        if !self.bindings_ensured {
            if let Err(error) = self.ensure_binding_paths().await {
                tracing::warn!(%error, host = %self.describe(), "could not prepare binding paths");
                return false;
            }
            self.bindings_ensured = true;
        }

        let Some(exe) = self.locator.locate(&self.config.version) else {
            tracing::warn!(
                version = %self.config.version,
                "no installation found for the requested host version"
            );
            return false;
        };

        let transport = match ChannelTransport::create(self.describe()).await {
            Ok(transport) => transport,
            Err(error) => {
                tracing::warn!(%error, "could not create the control channel");
                return false;
            }
        };

        let ready_file = Self::ready_file_path();

        let mut cmd = Command::new(&exe);
        if !self.config.profile.is_empty() {
            cmd.arg(&self.config.profile_flag).arg(&self.config.profile);
        }
        cmd.env(HOSTRUN_CHANNEL, transport.address().addr.to_string());
        cmd.env(HOSTRUN_CHANNEL_TOKEN, &transport.address().token);
        cmd.env(HOSTRUN_READY_FILE, &ready_file);
        if let Some(dir) = &self.config.agent_log_dir {
            cmd.env(HOSTRUN_AGENT_LOG, dir);
        }
        cmd.envs(self.ambient_instrumentation_env());
        cmd.envs(self.config.extra_env.iter().cloned());
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(%error, exe = %exe.display(), "host process failed to launch");
                return false;
            }
        };
        let pid = child.id().unwrap_or_default();
        tracing::info!(pid, host = %self.describe(), "launched host process");

        // Readiness: poll the host's "still initializing" signal. There is
        // deliberately no bound here beyond the caller's own timeout.
        let launched = LaunchedHost {
            pid,
            ready_file: ready_file.clone(),
        };
        loop {
            tokio::select! {
                _ = child.wait() => {
                    tracing::warn!(host = %self.describe(), "host process exited during startup");
                    let _ = tokio::fs::remove_file(&ready_file).await;
                    return false;
                }
                _ = tokio::time::sleep(self.config.ready_poll_interval) => {
                    if !self.probe.still_initializing(&launched).await {
                        break;
                    }
                }
            }
        }

        if let Err(error) = self.injector.inject(pid, &self.config.bootstrap) {
            tracing::warn!(%error, pid, "agent injection failed");
            let _ = child.start_kill();
            let _ = TimeoutFuture::new(child.wait(), KILL_GRACE).wait().await;
            let _ = tokio::fs::remove_file(&ready_file).await;
            return false;
        }

        if debugger::debugger_attached() {
            if let Some(attach) = &self.debugger {
                debugger::try_attach(&**attach, pid, DEBUG_ATTACH_ATTEMPTS, DEBUG_ATTACH_BASE_DELAY)
                    .await;
            }
        }

        self.running = Some(RunningHost {
            child,
            transport,
            ready_file,
        });
        true
    }

    fn is_started(&self) -> bool {
        self.running.is_some()
    }

    async fn connect(&mut self) -> Result<Box<dyn AgentChannel>, ConnectError> {
        let RunningHost {
            child, transport, ..
        } = self.running.as_mut().ok_or(ConnectError::NotStarted)?;

        let host_died = async {
            let _ = child.wait().await;
        };

        let (hello, channel) = transport
            .accept_agent(self.config.accept_timeout, host_died)
            .await?;

        tracing::info!(
            pid = hello.host.pid,
            version = %hello.host.version,
            profile = %hello.host.profile,
            "agent connected"
        );
        Ok(Box::new(channel))
    }

    async fn stop(&mut self) {
        let Some(RunningHost {
            mut child,
            transport,
            ready_file,
        }) = self.running.take()
        else {
            return;
        };

        if let Err(error) = child.start_kill() {
            tracing::debug!(%error, "host process was already gone");
        }
        if TimeoutFuture::new(child.wait(), KILL_GRACE)
            .wait()
            .await
            .is_none()
        {
            tracing::warn!(host = %self.describe(), "host process did not exit within the kill grace period");
        }

        // Dropping the transport unregisters the channel address.
        drop(transport);

        let _ = tokio::fs::remove_file(&ready_file).await;

        tracing::info!(host = %self.describe(), "host session stopped");
    }
}

impl Drop for ProcessHostController {
    fn drop(&mut self) {
        if let Some(running) = &mut self.running {
            // Last resort when a session survives to drop without an
            // explicit stop.
            let _ = running.child.start_kill();
        }
    }
}
