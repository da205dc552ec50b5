//! Lifecycle supervision of the single gateway process.
//!
//! # Single-flight starts
//!
//! Every caller of [`Supervisor::ensure_running`] that finds no running
//! gateway attaches to one in-flight start attempt. The attempt runs as its
//! own task so it completes even if every caller goes away, and its outcome
//! is fanned out through a [`Shared`] future. The attempt clears itself from
//! the supervisor before resolving, so the next call after a failure starts
//! fresh instead of reusing a stale result.
//!
//! # Locking
//!
//! All state transitions happen under one `parking_lot` mutex that is never
//! held across an `.await`. Spawning happens under that mutex, which is what
//! keeps a restart and an in-flight start from ever owning two processes.

use crate::config::Config;
use crate::error::StartError;
use crate::probe::ReadinessProbe;
use crate::process::{ExitInfo, ExitWatch, LaunchSpec, ProcessHandle, Spawner};
use crate::token::GatewayToken;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    /// No configuration exists; nothing may be started
    Unconfigured,
    /// No process; the next `ensure_running` spawns one
    Idle,
    /// A process exists but has not answered a readiness probe yet
    Starting,
    /// A process exists and has answered a readiness probe
    Running,
    /// The last process exited before it became ready
    Crashed,
}

/// Answers "is the system configured"
pub trait Configured: Send + Sync + 'static {
    fn is_configured(&self) -> bool;
}

impl<F> Configured for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_configured(&self) -> bool {
        self()
    }
}

/// Configured once the gateway's configuration file exists
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Configured for ConfigFile {
    fn is_configured(&self) -> bool {
        self.path.exists()
    }
}

/// Proof that the gateway answered a readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub target: SocketAddr,
}

/// Fixed parameters of the supervised gateway
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Where the gateway listens; constant for the process lifetime
    pub target: SocketAddr,
    pub launch: LaunchSpec,
    /// Directories created before every spawn
    pub dirs: Vec<PathBuf>,
    pub startup_timeout: Duration,
    /// Upper bound on waiting for a terminated gateway to exit during restart
    pub restart_grace: Duration,
    pub probe: ReadinessProbe,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config, token: &GatewayToken) -> anyhow::Result<Self> {
        let gateway = &config.gateway;
        let state_dir = config.state.state_dir();
        let workspace_dir = config.state.workspace_dir();

        let mut env: Vec<(String, String)> = gateway
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env.push((
            "WAKEGATE_STATE_DIR".to_string(),
            state_dir.to_string_lossy().into_owned(),
        ));
        env.push((
            "WAKEGATE_WORKSPACE_DIR".to_string(),
            workspace_dir.to_string_lossy().into_owned(),
        ));
        env.push((
            "WAKEGATE_GATEWAY_TOKEN".to_string(),
            token.as_str().to_string(),
        ));

        Ok(Self {
            target: gateway.target()?,
            launch: LaunchSpec {
                program: gateway.command.clone(),
                args: gateway.launch_args(token.as_str()),
                env,
                current_dir: None,
            },
            dirs: vec![state_dir, workspace_dir],
            startup_timeout: gateway.startup_timeout(),
            restart_grace: gateway.restart_grace(),
            probe: ReadinessProbe {
                interval: gateway.probe_interval(),
                path: gateway.probe_path.clone(),
                bearer: Some(token.as_str().to_string()),
            },
        })
    }
}

/// Lifecycle counters
#[derive(Debug, Default)]
pub struct SupervisorStats {
    spawns: AtomicU64,
    probes: AtomicU64,
    restarts: AtomicU64,
}

impl SupervisorStats {
    pub fn spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the supervisor, for diagnostics endpoints
#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub target: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub last_exit_signal: Option<i32>,
    pub spawns: u64,
    pub probes: u64,
    pub restarts: u64,
}

type StartFuture = Shared<BoxFuture<'static, Result<Ready, StartError>>>;

/// The in-flight start attempt every concurrent caller waits on
struct StartCoordinator {
    attempt: u64,
    future: StartFuture,
}

/// The owned process, tagged so late exit notifications can be told apart
struct Supervised {
    generation: u64,
    handle: ProcessHandle,
}

struct Inner {
    state: GatewayState,
    process: Option<Supervised>,
    starting: Option<StartCoordinator>,
    /// Exit of a process a restart is tearing down; no spawn happens before it
    stopping: Option<ExitWatch>,
    next_attempt: u64,
    next_generation: u64,
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<ExitInfo>,
}

impl Inner {
    fn is_current(&self, attempt: u64) -> bool {
        self.starting.as_ref().map(|c| c.attempt) == Some(attempt)
    }

    fn owns(&self, generation: u64) -> bool {
        self.process.as_ref().map(|p| p.generation) == Some(generation)
    }
}

enum ProbeOutcome {
    Ready,
    TimedOut,
    Exited(ExitInfo),
}

/// Supervises the gateway process.
///
/// Constructed once per host process and shared behind an `Arc`; methods that
/// start background work take `self: &Arc<Self>`.
pub struct Supervisor {
    inner: Mutex<Inner>,
    options: SupervisorOptions,
    spawner: Arc<dyn Spawner>,
    configured: Arc<dyn Configured>,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(
        options: SupervisorOptions,
        spawner: Arc<dyn Spawner>,
        configured: Arc<dyn Configured>,
    ) -> Arc<Self> {
        let state = if configured.is_configured() {
            GatewayState::Idle
        } else {
            GatewayState::Unconfigured
        };

        Arc::new(Self {
            inner: Mutex::new(Inner {
                state,
                process: None,
                starting: None,
                stopping: None,
                next_attempt: 1,
                next_generation: 1,
                started_at: None,
                last_exit: None,
            }),
            options,
            spawner,
            configured,
            stats: SupervisorStats::default(),
        })
    }

    /// The fixed forwarding target
    pub fn target(&self) -> SocketAddr {
        self.options.target
    }

    pub fn is_configured(&self) -> bool {
        self.configured.is_configured()
    }

    pub fn state(&self) -> GatewayState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn status(&self) -> GatewayStatus {
        let inner = self.inner.lock();
        GatewayStatus {
            state: inner.state,
            target: self.options.target.to_string(),
            pid: inner.process.as_ref().and_then(|p| p.handle.pid()),
            started_at: inner.started_at,
            last_exit_code: inner.last_exit.and_then(|e| e.code),
            last_exit_signal: inner.last_exit.and_then(|e| e.signal),
            spawns: self.stats.spawns(),
            probes: self.stats.probes(),
            restarts: self.stats.restarts(),
        }
    }

    fn ready(&self) -> Ready {
        Ready {
            target: self.options.target,
        }
    }

    /// Make sure the gateway is running, starting it if needed.
    ///
    /// Safe to call from any number of tasks at once: callers that arrive
    /// while a start is in flight wait for that start's outcome.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<Ready, StartError> {
        let configured = self.configured.is_configured();

        let start = {
            let mut inner = self.inner.lock();

            if !configured {
                if inner.process.is_none() && inner.starting.is_none() {
                    inner.state = GatewayState::Unconfigured;
                }
                return Err(StartError::NotConfigured);
            }

            let state = inner.state;
            match state {
                GatewayState::Running => return Ok(self.ready()),
                GatewayState::Unconfigured => {
                    info!("Gateway configuration detected");
                    inner.state = GatewayState::Idle;
                }
                _ => {}
            }

            let in_flight = inner
                .starting
                .as_ref()
                .map(|c| (c.attempt, c.future.clone()));
            match in_flight {
                Some((attempt, future)) => {
                    debug!(attempt, "Joining in-flight gateway start");
                    future
                }
                None => self.begin_attempt(&mut inner, None),
            }
        };

        start.await
    }

    /// Stop whatever gateway exists and start a fresh one.
    ///
    /// Takes precedence over a start already in flight: that attempt is
    /// detached. If it had not spawned yet its waiters end up with this
    /// restart's outcome; if it was already probing they get its own result.
    /// No new process is spawned until the torn-down one exits or
    /// `restart_grace` elapses, even when restarts overlap.
    pub async fn restart(self: &Arc<Self>) -> Result<Ready, StartError> {
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        let configured = self.configured.is_configured();

        let planned = {
            let mut inner = self.inner.lock();
            let old = inner.process.take().map(|p| p.handle);
            if let Some(ref old) = old {
                inner.stopping = Some(old.exit_watch());
            }
            if let Some(coordinator) = inner.starting.take() {
                debug!(attempt = coordinator.attempt, "Restart supersedes in-flight start");
            }
            info!(pid = old.as_ref().and_then(|h| h.pid()), "Restarting gateway");

            if configured {
                inner.state = GatewayState::Idle;
                Ok(self.begin_attempt(&mut inner, old))
            } else {
                inner.state = GatewayState::Unconfigured;
                Err(old)
            }
        };

        match planned {
            Ok(start) => start.await,
            Err(old) => {
                if let Some(old) = old {
                    self.stop_process(old).await;
                }
                Err(StartError::NotConfigured)
            }
        }
    }

    /// Best-effort termination of the gateway on host shutdown. Does not wait.
    pub fn shutdown(&self) {
        let inner = self.inner.lock();
        if let Some(ref process) = inner.process {
            info!(pid = process.handle.pid(), "Stopping gateway for shutdown");
            process.handle.terminate();
        }
    }

    /// Register a new start attempt. Called with the state lock held.
    fn begin_attempt(
        self: &Arc<Self>,
        inner: &mut Inner,
        previous: Option<ProcessHandle>,
    ) -> StartFuture {
        let attempt = inner.next_attempt;
        inner.next_attempt += 1;
        inner.state = GatewayState::Starting;

        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move { supervisor.run_attempt(attempt, previous).await });

        let supervisor = Arc::clone(self);
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(attempt, error = %e, "Gateway start task failed");
                    supervisor.abandon_attempt(attempt);
                    Err(StartError::NotReady(format!("start task failed: {}", e)))
                }
            }
        }
        .boxed()
        .shared();

        inner.starting = Some(StartCoordinator {
            attempt,
            future: future.clone(),
        });
        future
    }

    async fn run_attempt(
        self: Arc<Self>,
        attempt: u64,
        previous: Option<ProcessHandle>,
    ) -> Result<Ready, StartError> {
        if let Some(previous) = previous {
            self.stop_process(previous).await;
        }
        self.wait_for_teardown(attempt).await;

        let (generation, exit) = match self.acquire_process(attempt) {
            Acquired::Process(generation, exit) => (generation, exit),
            Acquired::Failed(err) => return Err(err),
            Acquired::Superseded(Some(newer)) => return newer.await,
            Acquired::Superseded(None) => {
                return Err(StartError::NotReady(
                    "start attempt was superseded by a restart".to_string(),
                ))
            }
        };

        self.stats.probes.fetch_add(1, Ordering::Relaxed);
        let timeout = self.options.startup_timeout;
        let outcome = tokio::select! {
            ready = self.options.probe.wait_ready(self.options.target, timeout) => {
                if ready { ProbeOutcome::Ready } else { ProbeOutcome::TimedOut }
            }
            info = exit.wait() => ProbeOutcome::Exited(info),
        };

        self.finish_attempt(attempt, generation, outcome)
    }

    /// Wait, bounded by the restart grace, for a process an earlier restart
    /// is still tearing down
    async fn wait_for_teardown(&self, attempt: u64) {
        let stopping = self.inner.lock().stopping.clone();
        let Some(exit) = stopping else { return };
        if exit.has_exited() {
            return;
        }

        debug!(attempt, "Waiting for previous gateway to exit before spawning");
        let grace = self.options.restart_grace;
        if tokio::time::timeout(grace, exit.wait()).await.is_err() {
            warn!(
                attempt,
                grace_ms = grace.as_millis() as u64,
                "Previous gateway still running after grace period"
            );
        }
    }

    /// Reuse the live process or spawn a new one, under the state lock
    fn acquire_process(self: &Arc<Self>, attempt: u64) -> Acquired {
        let dirs_result = self
            .options
            .dirs
            .iter()
            .try_for_each(std::fs::create_dir_all);

        let mut inner = self.inner.lock();

        if !inner.is_current(attempt) {
            return Acquired::Superseded(inner.starting.as_ref().map(|c| c.future.clone()));
        }

        if let Some(ref process) = inner.process {
            if !process.handle.has_exited() {
                debug!(attempt, pid = process.handle.pid(), "Re-probing existing gateway process");
                return Acquired::Process(process.generation, process.handle.exit_watch());
            }
        }
        inner.process = None;

        if let Err(e) = dirs_result {
            debug!(error = %e, "Failed to create gateway state directories");
            inner.starting = None;
            inner.state = GatewayState::Idle;
            return Acquired::Failed(StartError::SpawnFailure(format!(
                "cannot create state directories: {}",
                e
            )));
        }

        // Waited for (or given up on) in `wait_for_teardown`
        inner.stopping = None;

        match self.spawner.spawn(&self.options.launch) {
            Ok(handle) => {
                self.stats.spawns.fetch_add(1, Ordering::Relaxed);
                let generation = inner.next_generation;
                inner.next_generation += 1;
                let exit = handle.exit_watch();
                info!(attempt, generation, pid = handle.pid(), "Gateway spawned");

                inner.process = Some(Supervised { generation, handle });
                inner.started_at = Some(Utc::now());
                self.watch_exit(generation, exit.clone());
                Acquired::Process(generation, exit)
            }
            Err(e) => {
                debug!(program = %self.options.launch.program, error = %e, "Failed to spawn gateway");
                inner.starting = None;
                inner.state = GatewayState::Idle;
                Acquired::Failed(StartError::SpawnFailure(e.to_string()))
            }
        }
    }

    /// Apply a probe outcome and clear the coordinator, if still current
    fn finish_attempt(
        &self,
        attempt: u64,
        generation: u64,
        outcome: ProbeOutcome,
    ) -> Result<Ready, StartError> {
        let mut inner = self.inner.lock();
        let current = inner.is_current(attempt);
        if current {
            inner.starting = None;
        }
        let owned = current && inner.owns(generation);

        match outcome {
            ProbeOutcome::Ready => {
                if owned {
                    inner.state = GatewayState::Running;
                    info!(attempt, gateway = %self.options.target, "Gateway is ready");
                }
                Ok(self.ready())
            }
            ProbeOutcome::TimedOut => {
                let timeout_ms = self.options.startup_timeout.as_millis() as u64;
                if owned {
                    let exited = inner
                        .process
                        .as_ref()
                        .and_then(|p| p.handle.exit_watch().get());
                    match exited {
                        Some(info) => {
                            inner.process = None;
                            inner.last_exit = Some(info);
                            inner.state = GatewayState::Crashed;
                        }
                        // Left alive; the next call re-probes it instead of spawning
                        None => inner.state = GatewayState::Starting,
                    }
                }
                debug!(attempt, timeout_ms, "Gateway did not become ready in time");
                Err(StartError::NotReady(format!(
                    "gateway did not accept connections within {}ms",
                    timeout_ms
                )))
            }
            ProbeOutcome::Exited(info) => {
                if owned {
                    inner.process = None;
                    inner.last_exit = Some(info);
                    inner.state = GatewayState::Crashed;
                }
                debug!(attempt, %info, "Gateway exited before becoming ready");
                Err(StartError::NotReady(format!(
                    "gateway exited before becoming ready ({})",
                    info
                )))
            }
        }
    }

    fn abandon_attempt(&self, attempt: u64) {
        let mut inner = self.inner.lock();
        if inner.is_current(attempt) {
            inner.starting = None;
            inner.state = if inner.process.is_some() {
                GatewayState::Starting
            } else {
                GatewayState::Idle
            };
        }
    }

    fn watch_exit(self: &Arc<Self>, generation: u64, exit: ExitWatch) {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            let info = exit.wait().await;
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.handle_exit(generation, info);
            }
        });
    }

    fn handle_exit(&self, generation: u64, info: ExitInfo) {
        let mut inner = self.inner.lock();
        if !inner.owns(generation) {
            debug!(generation, %info, "Previous gateway process exited");
            return;
        }

        inner.process = None;
        inner.last_exit = Some(info);
        let previous = inner.state;
        inner.state = match previous {
            GatewayState::Starting => GatewayState::Crashed,
            _ => GatewayState::Idle,
        };
        warn!(generation, %info, ?previous, state = ?inner.state, "Gateway process exited");
    }

    /// Terminate a process we no longer track and give it time to release its port
    async fn stop_process(&self, handle: ProcessHandle) {
        handle.terminate();
        let grace = self.options.restart_grace;
        match tokio::time::timeout(grace, handle.exit_watch().wait()).await {
            Ok(info) => debug!(%info, "Previous gateway stopped"),
            Err(_) => warn!(
                pid = handle.pid(),
                grace_ms = grace.as_millis() as u64,
                "Previous gateway still running after grace period"
            ),
        }
    }
}

enum Acquired {
    Process(u64, ExitWatch),
    Failed(StartError),
    Superseded(Option<StartFuture>),
}
