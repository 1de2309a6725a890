//! Provisioning passwordless access to the privileged tools.
//!
//! The workflow runs on its own thread and walks a fixed list of steps:
//!
//! 1. check whether the privileged tools already run without a prompt
//! 2. make sure the package manager exists, installing it if missing
//! 3. install the tool package through the package manager
//! 4. install a sudoers policy scoped to exactly those commands
//!
//! Satisfied steps are skipped, the first failing step ends the run, and a
//! trigger while a run is in flight joins that run instead of starting another.
//! Every side effect goes through a [`PrivilegeHost`] so the state machine can
//! be driven without real elevation.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::command::{CommandRunner, CommandSpec, Elevation, shell_quote};
use crate::error::BootstrapError;
use crate::probes::disk::find_smartctl;
use crate::probes::gpu::POWERMETRICS;

/// Where the scoped sudoers policy is written.
pub const SUDOERS_FILE: &str = "/etc/sudoers.d/livestat";

const BREW_PATHS: [&str; 2] = ["/opt/homebrew/bin/brew", "/usr/local/bin/brew"];
const HOMEBREW_INSTALL_URL: &str = "https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh";
const TOOL_PACKAGE: &str = "smartmontools";
const VISUDO: &str = "/usr/sbin/visudo";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the process stands with privileged access. Moves forward only,
/// except `Failed` which returns to `Unchecked` when a run is retried.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PrivilegeState {
    #[default]
    Unchecked,
    Checking,
    InstallingDependency,
    ConfiguringPolicy,
    Enabled,
    Failed(String),
}

impl PrivilegeState {
    fn rank(&self) -> u8 {
        match self {
            Self::Unchecked => 0,
            Self::Checking => 1,
            Self::InstallingDependency => 2,
            Self::ConfiguringPolicy => 3,
            Self::Enabled | Self::Failed(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Enabled | Self::Failed(_))
    }
}

impl fmt::Display for PrivilegeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchecked => f.write_str("unchecked"),
            Self::Checking => f.write_str("checking"),
            Self::InstallingDependency => f.write_str("installing dependency"),
            Self::ConfiguringPolicy => f.write_str("configuring policy"),
            Self::Enabled => f.write_str("enabled"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStep {
    CheckCapabilities,
    EnsurePackageManager,
    InstallTool,
    InstallPolicy,
}

impl BootstrapStep {
    pub const ALL: [BootstrapStep; 4] = [
        Self::CheckCapabilities,
        Self::EnsurePackageManager,
        Self::InstallTool,
        Self::InstallPolicy,
    ];

    /// State the process is in while this step runs.
    pub fn state(self) -> PrivilegeState {
        match self {
            Self::CheckCapabilities => PrivilegeState::Checking,
            Self::EnsurePackageManager | Self::InstallTool => PrivilegeState::InstallingDependency,
            Self::InstallPolicy => PrivilegeState::ConfiguringPolicy,
        }
    }
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CheckCapabilities => "check capabilities",
            Self::EnsurePackageManager => "install package manager",
            Self::InstallTool => "install tools",
            Self::InstallPolicy => "configure permissions",
        })
    }
}

/// What a ticket holder observes. A run ends with exactly one `Finished`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BootstrapEvent {
    Status { step: BootstrapStep, message: String },
    Finished(Result<String, BootstrapError>),
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Side effects the workflow needs. Installers return a human-readable
/// message on success and the reason on failure.
pub trait PrivilegeHost: Send + Sync {
    /// The privileged tools already run without a password prompt.
    fn capabilities_usable(&self) -> bool;
    fn package_manager(&self) -> Option<String>;
    fn install_package_manager(&self) -> Result<String, String>;
    /// Path of the privileged tool once installed.
    fn tool_path(&self) -> Option<String>;
    fn install_tool(&self, package_manager: &str) -> Result<String, String>;
    fn install_policy(&self, tool_path: &str) -> Result<String, String>;
}

/// Walk the steps against `host`, reporting each step that does work.
fn run_steps(
    host: &dyn PrivilegeHost,
    report: &dyn Fn(BootstrapStep, String),
) -> Result<String, BootstrapError> {
    report(BootstrapStep::CheckCapabilities, "Checking privileged access...".into());
    if host.capabilities_usable() {
        return Ok("Already enabled.".into());
    }

    let package_manager = match host.package_manager() {
        Some(pm) => pm,
        None => {
            let step = BootstrapStep::EnsurePackageManager;
            report(step, "Installing Homebrew...".into());
            host.install_package_manager()
                .map_err(|reason| BootstrapError::step_failed(step, reason))?;
            host.package_manager()
                .ok_or_else(|| BootstrapError::step_failed(step, "Homebrew not found after install"))?
        }
    };

    let tool = match host.tool_path() {
        Some(path) => path,
        None => {
            let step = BootstrapStep::InstallTool;
            report(step, format!("Installing {TOOL_PACKAGE}..."));
            host.install_tool(&package_manager)
                .map_err(|reason| BootstrapError::step_failed(step, reason))?;
            host.tool_path()
                .ok_or_else(|| BootstrapError::step_failed(step, "smartctl not found after install"))?
        }
    };

    let step = BootstrapStep::InstallPolicy;
    report(step, "Configuring permissions...".into());
    host.install_policy(&tool)
        .map_err(|reason| BootstrapError::step_failed(step, reason))?;
    Ok("Enabled.".into())
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

struct Run {
    id: String,
    events: Vec<BootstrapEvent>,
    listeners: Vec<Sender<BootstrapEvent>>,
    outcome: Option<Result<String, BootstrapError>>,
}

impl Run {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            events: Vec::new(),
            listeners: Vec::new(),
            outcome: None,
        }
    }

    fn in_flight(&self) -> bool {
        self.outcome.is_none()
    }

    fn subscribe(&mut self) -> Receiver<BootstrapEvent> {
        let (tx, rx) = mpsc::channel();
        for event in &self.events {
            let _ = tx.send(event.clone());
        }
        if self.in_flight() {
            self.listeners.push(tx);
        }
        rx
    }

    fn emit(&mut self, event: BootstrapEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
        self.events.push(event);
    }
}

#[derive(Default)]
struct Inner {
    state: PrivilegeState,
    run: Option<Run>,
}

type FinishHook = Box<dyn Fn(&Result<String, BootstrapError>) + Send + Sync>;

struct Shared {
    inner: Mutex<Inner>,
    finished: Condvar,
    hooks: Mutex<Vec<FinishHook>>,
}

impl Shared {
    fn advance(&self, run_id: &str, step: BootstrapStep, message: String) {
        let mut inner = self.inner.lock().unwrap();
        let next = step.state();
        if next.rank() > inner.state.rank() {
            log::info!("privilege state {} -> {next}", inner.state);
            inner.state = next;
        }
        if let Some(run) = inner.run.as_mut().filter(|r| r.id == run_id) {
            run.emit(BootstrapEvent::Status { step, message });
        }
    }

    fn finish(&self, run_id: &str, outcome: Result<String, BootstrapError>) {
        for hook in self.hooks.lock().unwrap().iter() {
            hook(&outcome);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.state = match &outcome {
            Ok(message) => {
                log::info!("privileged access enabled: {message}");
                PrivilegeState::Enabled
            }
            Err(e) => {
                log::warn!("privilege bootstrap failed: {e}");
                PrivilegeState::Failed(e.to_string())
            }
        };
        if let Some(run) = inner.run.as_mut().filter(|r| r.id == run_id) {
            run.emit(BootstrapEvent::Finished(outcome.clone()));
            run.listeners.clear();
            run.outcome = Some(outcome);
        }
        self.finished.notify_all();
    }
}

/// Handle on one bootstrap run.
pub struct BootstrapTicket {
    pub run_id: String,
    pub events: Receiver<BootstrapEvent>,
    shared: Arc<Shared>,
}

impl BootstrapTicket {
    /// Block until the run this ticket belongs to has finished.
    pub fn wait(self) -> Result<String, BootstrapError> {
        let inner = self.shared.inner.lock().unwrap();
        let inner = self
            .shared
            .finished
            .wait_while(inner, |i| {
                i.run.as_ref().is_some_and(|r| r.id == self.run_id && r.in_flight())
            })
            .unwrap();
        match inner.run.as_ref().filter(|r| r.id == self.run_id) {
            Some(run) => run.outcome.clone().unwrap_or_else(|| {
                Err(BootstrapError::step_failed("bootstrap", "run ended without a result"))
            }),
            // replaced by a later run, so the outcome is on the event stream
            None => self
                .events
                .iter()
                .find_map(|e| match e {
                    BootstrapEvent::Finished(outcome) => Some(outcome),
                    BootstrapEvent::Status { .. } => None,
                })
                .unwrap_or_else(|| {
                    Err(BootstrapError::step_failed("bootstrap", "run ended without a result"))
                }),
        }
    }

    /// Current process-wide state, not just this run's.
    pub fn state(&self) -> PrivilegeState {
        self.shared.inner.lock().unwrap().state.clone()
    }
}

/// Owner of the process-wide privilege state. At most one run is in flight.
#[derive(Clone)]
pub struct PrivilegeBootstrap {
    host: Arc<dyn PrivilegeHost>,
    shared: Arc<Shared>,
}

impl PrivilegeBootstrap {
    pub fn new(host: Arc<dyn PrivilegeHost>) -> Self {
        Self {
            host,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                finished: Condvar::new(),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run `hook` with every outcome, before waiters are released.
    pub fn on_finished<F>(&self, hook: F)
    where
        F: Fn(&Result<String, BootstrapError>) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn state(&self) -> PrivilegeState {
        self.shared.inner.lock().unwrap().state.clone()
    }

    /// Outcome of the most recent finished run.
    pub fn last_outcome(&self) -> Option<Result<String, BootstrapError>> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .run
            .as_ref()
            .and_then(|r| r.outcome.clone())
    }

    pub fn in_flight(&self) -> bool {
        self.shared
            .inner
            .lock()
            .unwrap()
            .run
            .as_ref()
            .is_some_and(Run::in_flight)
    }

    /// Start a run, or join the one in flight. Events already emitted are
    /// replayed to the new ticket.
    pub fn trigger(&self) -> BootstrapTicket {
        let mut inner = self.shared.inner.lock().unwrap();

        if let Some(run) = inner.run.as_mut().filter(|r| r.in_flight()) {
            log::debug!("joining privilege bootstrap run {}", run.id);
            return BootstrapTicket {
                run_id: run.id.clone(),
                events: run.subscribe(),
                shared: self.shared.clone(),
            };
        }

        if inner.state == PrivilegeState::Enabled {
            let mut run = Run::new();
            run.emit(BootstrapEvent::Finished(Ok("Already enabled.".into())));
            run.outcome = Some(Ok("Already enabled.".into()));
            let ticket = BootstrapTicket {
                run_id: run.id.clone(),
                events: run.subscribe(),
                shared: self.shared.clone(),
            };
            inner.run = Some(run);
            return ticket;
        }

        if matches!(inner.state, PrivilegeState::Failed(_)) {
            log::info!("retrying privilege bootstrap");
        }
        inner.state = PrivilegeState::Unchecked;
        let mut run = Run::new();
        let run_id = run.id.clone();
        let events = run.subscribe();
        inner.run = Some(run);
        drop(inner);

        log::info!("privilege bootstrap run {run_id} started");
        let shared = self.shared.clone();
        let host = self.host.clone();
        let worker_id = run_id.clone();
        let spawned = std::thread::Builder::new()
            .name("livestat-privileges".into())
            .spawn(move || {
                let report = |step, message| shared.advance(&worker_id, step, message);
                let outcome = catch_unwind(AssertUnwindSafe(|| run_steps(host.as_ref(), &report)))
                    .unwrap_or_else(|_| {
                        Err(BootstrapError::step_failed("bootstrap", "worker panicked"))
                    });
                shared.finish(&worker_id, outcome);
            });
        if let Err(e) = spawned {
            log::error!("failed to start privilege bootstrap: {e}");
            self.shared.finish(
                &run_id,
                Err(BootstrapError::step_failed("bootstrap", format!("thread spawn failed: {e}"))),
            );
        }

        BootstrapTicket {
            run_id,
            events,
            shared: self.shared.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// macOS host
// ---------------------------------------------------------------------------

/// Homebrew, smartmontools and a sudoers drop-in, driven through a
/// [`CommandRunner`].
pub struct MacPrivilegeHost {
    runner: Arc<dyn CommandRunner>,
    user: String,
    probe_timeout: Duration,
}

impl MacPrivilegeHost {
    pub fn new(runner: Arc<dyn CommandRunner>, probe_timeout: Duration) -> Self {
        let user = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .or_else(|| {
                runner
                    .stdout(&CommandSpec::new("id").arg("-un").timeout(Duration::from_secs(1)))
                    .ok()
            })
            .unwrap_or_else(|| "root".into());
        Self {
            runner,
            user,
            probe_timeout,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// The single sudoers line granting the sampled commands.
    pub fn sudoers_line(&self, tool_path: &str) -> String {
        format!("{} ALL=(root) NOPASSWD: {POWERMETRICS}, {tool_path}", self.user)
    }

    fn sudo_ok(&self, spec: CommandSpec) -> bool {
        let spec = spec
            .elevated(Elevation::NonInteractiveSudo)
            .timeout(self.probe_timeout);
        self.runner.run(&spec).is_ok_and(|out| out.success)
    }
}

impl PrivilegeHost for MacPrivilegeHost {
    fn capabilities_usable(&self) -> bool {
        let powermetrics = CommandSpec::new(POWERMETRICS).args(["-n", "1", "-i", "1"]);
        if !self.sudo_ok(powermetrics) {
            return false;
        }
        self.tool_path()
            .is_some_and(|smartctl| self.sudo_ok(CommandSpec::new(smartctl).arg("--version")))
    }

    fn package_manager(&self) -> Option<String> {
        BREW_PATHS
            .into_iter()
            .find(|p| Path::new(p).exists())
            .map(str::to_string)
            .or_else(|| self.runner.which("brew"))
    }

    fn install_package_manager(&self) -> Result<String, String> {
        let user = shell_quote(&self.user);
        let script = format!(
            "/bin/mkdir -p /opt/homebrew; /usr/sbin/chown -R {user}:admin /opt/homebrew; \
             /usr/bin/su -l {user} -c {}",
            shell_quote(&format!(
                "NONINTERACTIVE=1 /bin/bash -c \"$(curl -fsSL {HOMEBREW_INSTALL_URL})\""
            ))
        );
        let spec = CommandSpec::new("/bin/sh")
            .args(["-c", script.as_str()])
            .elevated(Elevation::Administrator)
            .timeout(Duration::from_secs(900));
        match self.runner.run(&spec) {
            Ok(out) if out.success => Ok(non_empty(out.combined(), "Homebrew installed.")),
            Ok(out) => Err(non_empty(out.combined(), "Homebrew install failed.")),
            Err(e) => Err(e.to_string()),
        }
    }

    fn tool_path(&self) -> Option<String> {
        find_smartctl(self.runner.as_ref())
    }

    fn install_tool(&self, package_manager: &str) -> Result<String, String> {
        let direct = CommandSpec::new(package_manager)
            .args(["install", TOOL_PACKAGE])
            .env("HOMEBREW_NO_AUTO_UPDATE", "1")
            .timeout(Duration::from_secs(600));
        let first = match self.runner.run(&direct) {
            Ok(out) => out.combined().trim().to_string(),
            Err(e) => format!("direct install failed: {e}"),
        };
        if self.tool_path().is_some() || first.to_lowercase().contains("already installed") {
            return Ok(non_empty(first, "smartmontools installed."));
        }

        // a GUI-launched process may lack Homebrew on PATH
        log::debug!("retrying {TOOL_PACKAGE} install through a login shell");
        let line = format!(
            "export PATH=\"/opt/homebrew/bin:/usr/local/bin:$PATH\"; HOMEBREW_NO_AUTO_UPDATE=1 {} install {TOOL_PACKAGE} 2>&1",
            shell_quote(package_manager)
        );
        let fallback = CommandSpec::new("/bin/sh")
            .args(["-c", line.as_str()])
            .elevated(Elevation::AppleScript)
            .timeout(Duration::from_secs(600));
        let second = match self.runner.run(&fallback) {
            Ok(out) => out.combined().trim().to_string(),
            Err(e) => e.to_string(),
        };
        if self.tool_path().is_some() || second.to_lowercase().contains("already installed") {
            return Ok(non_empty(second, "smartmontools installed."));
        }
        Err(non_empty(second, &non_empty(first, "smartmontools install failed.")))
    }

    fn install_policy(&self, tool_path: &str) -> Result<String, String> {
        let script = policy_install_script(&self.sudoers_line(tool_path));
        let spec = CommandSpec::new("/bin/sh")
            .args(["-c", script.as_str()])
            .elevated(Elevation::Administrator)
            .timeout(Duration::from_secs(30));
        match self.runner.run(&spec) {
            Ok(out) if out.success => Ok(non_empty(out.combined(), "Permissions enabled.")),
            Ok(out) => Err(non_empty(out.combined(), "Permission setup failed.")),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Shell script that stages `line` in a temp file, has `visudo -c` check it
/// and only then moves it into place. A rejected policy never reaches
/// `/etc/sudoers.d`.
fn policy_install_script(line: &str) -> String {
    [
        "tmp=$(mktemp /tmp/livestat-sudoers.XXXXXX) || exit 1".to_string(),
        format!("echo {} > \"$tmp\"", shell_quote(line)),
        format!(
            "if ! {VISUDO} -cf \"$tmp\"; then rm -f \"$tmp\"; echo 'sudoers policy rejected by visudo' >&2; exit 1; fi"
        ),
        "mkdir -p /etc/sudoers.d".to_string(),
        "chmod 440 \"$tmp\"".to_string(),
        "chown root:wheel \"$tmp\"".to_string(),
        format!("mv -f \"$tmp\" {SUDOERS_FILE}"),
    ]
    .join(" && ")
}

fn non_empty(text: String, fallback: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        fallback.to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::ScriptedRunner;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory host. `gate` holds the tool install until released.
    #[derive(Default)]
    struct FakeHost {
        usable: AtomicBool,
        has_brew: AtomicBool,
        has_tool: AtomicBool,
        policy_fails: AtomicBool,
        tool_installs: AtomicU32,
        policy_installs: AtomicU32,
        gate: Mutex<bool>,
        released: Condvar,
    }

    impl FakeHost {
        fn release(&self) {
            *self.gate.lock().unwrap() = true;
            self.released.notify_all();
        }
    }

    impl PrivilegeHost for FakeHost {
        fn capabilities_usable(&self) -> bool {
            self.usable.load(Ordering::SeqCst)
        }
        fn package_manager(&self) -> Option<String> {
            self.has_brew
                .load(Ordering::SeqCst)
                .then(|| "/opt/homebrew/bin/brew".to_string())
        }
        fn install_package_manager(&self) -> Result<String, String> {
            self.has_brew.store(true, Ordering::SeqCst);
            Ok("Homebrew installed.".into())
        }
        fn tool_path(&self) -> Option<String> {
            self.has_tool
                .load(Ordering::SeqCst)
                .then(|| "/opt/homebrew/sbin/smartctl".to_string())
        }
        fn install_tool(&self, _: &str) -> Result<String, String> {
            let open = self.gate.lock().unwrap();
            let _open = self.released.wait_while(open, |o| !*o).unwrap();
            self.tool_installs.fetch_add(1, Ordering::SeqCst);
            self.has_tool.store(true, Ordering::SeqCst);
            Ok("installed".into())
        }
        fn install_policy(&self, _: &str) -> Result<String, String> {
            self.policy_installs.fetch_add(1, Ordering::SeqCst);
            if self.policy_fails.load(Ordering::SeqCst) {
                return Err("user cancelled".into());
            }
            self.usable.store(true, Ordering::SeqCst);
            Ok("Permissions enabled.".into())
        }
    }

    fn statuses(events: &[BootstrapEvent]) -> Vec<BootstrapStep> {
        events
            .iter()
            .filter_map(|e| match e {
                BootstrapEvent::Status { step, .. } => Some(*step),
                BootstrapEvent::Finished(_) => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Workflow
    // -----------------------------------------------------------------------

    #[test]
    fn already_usable_is_a_no_op() {
        let host = Arc::new(FakeHost::default());
        host.usable.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host.clone());
        let ticket = boot.trigger();
        assert_eq!(ticket.wait(), Ok("Already enabled.".into()));
        assert_eq!(boot.state(), PrivilegeState::Enabled);
        assert_eq!(host.policy_installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_run_emits_each_step_then_finishes() {
        let host = Arc::new(FakeHost::default());
        host.release();
        let boot = PrivilegeBootstrap::new(host.clone());
        let ticket = boot.trigger();
        let events: Vec<BootstrapEvent> = ticket.events.iter().collect();
        assert_eq!(statuses(&events), BootstrapStep::ALL.to_vec());
        assert_eq!(events.last(), Some(&BootstrapEvent::Finished(Ok("Enabled.".into()))));
        assert_eq!(
            events.iter().filter(|e| matches!(e, BootstrapEvent::Finished(_))).count(),
            1
        );
        assert_eq!(boot.state(), PrivilegeState::Enabled);
    }

    #[test]
    fn satisfied_steps_are_skipped() {
        let host = Arc::new(FakeHost::default());
        host.has_brew.store(true, Ordering::SeqCst);
        host.has_tool.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host.clone());
        let events: Vec<BootstrapEvent> = boot.trigger().events.iter().collect();
        assert_eq!(
            statuses(&events),
            vec![BootstrapStep::CheckCapabilities, BootstrapStep::InstallPolicy]
        );
        assert_eq!(host.tool_installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_step_aborts_and_retry_starts_over() {
        let host = Arc::new(FakeHost::default());
        host.has_brew.store(true, Ordering::SeqCst);
        host.has_tool.store(true, Ordering::SeqCst);
        host.policy_fails.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host.clone());

        let err = boot.trigger().wait().unwrap_err();
        assert_eq!(
            err,
            BootstrapError::step_failed(BootstrapStep::InstallPolicy, "user cancelled")
        );
        assert!(matches!(boot.state(), PrivilegeState::Failed(_)));

        host.policy_fails.store(false, Ordering::SeqCst);
        let ticket = boot.trigger();
        assert_eq!(ticket.wait(), Ok("Enabled.".into()));
        assert_eq!(host.policy_installs.load(Ordering::SeqCst), 2);
        assert_eq!(boot.last_outcome(), Some(Ok("Enabled.".into())));
    }

    #[test]
    fn finish_hook_runs_before_waiters_return() {
        let host = Arc::new(FakeHost::default());
        host.usable.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host);
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        boot.on_finished(move |outcome| {
            if outcome.is_ok() {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });
        boot.trigger().wait().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trigger_after_enabled_does_not_rerun() {
        let host = Arc::new(FakeHost::default());
        host.usable.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host);
        let first = boot.trigger();
        let first_id = first.run_id.clone();
        first.wait().unwrap();
        let second = boot.trigger();
        assert_ne!(second.run_id, first_id);
        assert!(!boot.in_flight());
        assert_eq!(second.wait(), Ok("Already enabled.".into()));
    }

    #[test]
    fn state_only_moves_forward() {
        assert!(PrivilegeState::Checking.rank() < PrivilegeState::InstallingDependency.rank());
        assert!(PrivilegeState::ConfiguringPolicy.rank() < PrivilegeState::Enabled.rank());
        assert!(PrivilegeState::Failed("x".into()).is_terminal());
        assert_eq!(
            serde_json::to_value(PrivilegeState::Failed("no".into())).unwrap(),
            serde_json::json!({"state": "failed", "reason": "no"})
        );
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_triggers_share_one_run_and_result() {
        let host = Arc::new(FakeHost::default());
        host.has_brew.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host.clone());

        let a = boot.trigger();
        let b = boot.trigger();
        assert_eq!(a.run_id, b.run_id);
        assert!(boot.in_flight());

        let waiters: Vec<_> = [a, b]
            .into_iter()
            .map(|t| std::thread::spawn(move || t.wait()))
            .collect();
        host.release();
        let results: Vec<_> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], Ok("Enabled.".into()));
        assert_eq!(host.tool_installs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_joiner_sees_replayed_events() {
        let host = Arc::new(FakeHost::default());
        host.has_brew.store(true, Ordering::SeqCst);
        let boot = PrivilegeBootstrap::new(host.clone());
        let first = boot.trigger();
        // wait until the worker is parked inside install_tool
        let status = first.events.recv().unwrap();
        assert!(matches!(status, BootstrapEvent::Status { step: BootstrapStep::CheckCapabilities, .. }));
        assert_eq!(
            first.events.recv().unwrap(),
            BootstrapEvent::Status {
                step: BootstrapStep::InstallTool,
                message: "Installing smartmontools...".into()
            }
        );

        let late = boot.trigger();
        host.release();
        let replayed: Vec<BootstrapEvent> = late.events.iter().collect();
        assert_eq!(
            statuses(&replayed),
            vec![
                BootstrapStep::CheckCapabilities,
                BootstrapStep::InstallTool,
                BootstrapStep::InstallPolicy
            ]
        );
        assert!(matches!(replayed.last(), Some(BootstrapEvent::Finished(Ok(_)))));
    }

    // -----------------------------------------------------------------------
    // macOS host
    // -----------------------------------------------------------------------

    #[test]
    fn capability_probe_uses_non_interactive_sudo() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .stdout("which smartctl", "/opt/homebrew/sbin/smartctl")
                .stdout("sudo -n /usr/bin/powermetrics -n 1 -i 1", "ok")
                .on("sudo -n /opt/homebrew/sbin/smartctl --version", |_| {
                    Ok(CommandOutput::failed(1, "sudo: a password is required"))
                }),
        );
        let host = MacPrivilegeHost::new(runner.clone(), Duration::from_secs(1));
        assert!(!host.capabilities_usable());
        assert_eq!(runner.calls_matching("sudo -n"), 2);
    }

    #[test]
    fn policy_written_through_one_admin_prompt() {
        let runner = Arc::new(ScriptedRunner::new().stdout("osascript", ""));
        let host = MacPrivilegeHost::new(runner.clone(), Duration::from_secs(1)).with_user("ada");
        assert_eq!(
            host.sudoers_line("/opt/homebrew/sbin/smartctl"),
            "ada ALL=(root) NOPASSWD: /usr/bin/powermetrics, /opt/homebrew/sbin/smartctl"
        );
        assert_eq!(
            host.install_policy("/opt/homebrew/sbin/smartctl"),
            Ok("Permissions enabled.".into())
        );
        assert_eq!(runner.calls_matching("osascript"), 1);
        let calls = runner.calls.lock().unwrap();
        let prompt = calls.iter().find(|c| c.contains("osascript")).unwrap();
        assert!(prompt.contains("with administrator privileges"));
        assert!(prompt.contains(SUDOERS_FILE));
        assert!(prompt.contains("chmod 440"));
        assert!(prompt.contains("visudo -cf"));
    }

    #[test]
    fn policy_is_checked_by_visudo_before_it_is_moved_into_place() {
        let script = policy_install_script("ada ALL=(root) NOPASSWD: /usr/bin/powermetrics");
        let check = script.find("/usr/sbin/visudo -cf").unwrap();
        let stage = script.find("echo 'ada ALL=(root)").unwrap();
        let install = script.find(&format!("mv -f \"$tmp\" {SUDOERS_FILE}")).unwrap();
        assert!(stage < check && check < install);
        // nothing writes the live file except the final move
        assert_eq!(script.matches(SUDOERS_FILE).count(), 1);
    }

    #[test]
    fn rejected_policy_reports_the_visudo_error() {
        let runner = Arc::new(ScriptedRunner::new().on("osascript", |_| {
            Ok(CommandOutput::failed(
                1,
                "/tmp/livestat-sudoers.Ab12Cd:1:4: syntax error\nsudoers policy rejected by visudo",
            ))
        }));
        let host = MacPrivilegeHost::new(runner, Duration::from_secs(1)).with_user("bad user");
        let err = host.install_policy("/opt/homebrew/sbin/smartctl").unwrap_err();
        assert!(err.contains("syntax error"));
        assert!(err.contains("rejected by visudo"));
    }

    #[test]
    fn tool_install_accepts_already_installed() {
        let runner = Arc::new(ScriptedRunner::new().on("install smartmontools", |spec| {
            assert_eq!(
                spec.env.get("HOMEBREW_NO_AUTO_UPDATE").map(String::as_str),
                Some("1")
            );
            Ok(CommandOutput::ok("Warning: smartmontools 7.4 is already installed"))
        }));
        let host = MacPrivilegeHost::new(runner.clone(), Duration::from_secs(1));
        let msg = host.install_tool("/opt/homebrew/bin/brew").unwrap();
        assert!(msg.contains("already installed"));
        assert_eq!(runner.calls_matching("osascript"), 0);
    }
}
