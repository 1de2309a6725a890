//! Bounded subprocess execution.
//!
//! Every external tool call goes through a [`CommandRunner`] so probes and the
//! privilege bootstrap can be exercised with a scripted runner in tests. The
//! system runner polls the child with `try_wait` and kills it once the
//! deadline passes; stdout and stderr are drained on helper threads so a chatty
//! tool (`ioreg -l`) cannot fill the pipe and stall.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ProbeError;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How a command is elevated before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Elevation {
    #[default]
    None,
    /// `sudo -n`: succeeds only when a passwordless policy already covers the command.
    NonInteractiveSudo,
    /// Wrapped in an AppleScript `do shell script` with administrator privileges,
    /// which shows exactly one authorization prompt.
    Administrator,
    /// Wrapped in an AppleScript `do shell script` without elevation, which runs
    /// through a login-like shell environment.
    AppleScript,
}

/// A single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub elevation: Elevation,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(2),
            elevation: Elevation::None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn elevated(mut self, elevation: Elevation) -> Self {
        self.elevation = elevation;
        self
    }

    /// Short name used in logs and diagnostics.
    pub fn label(&self) -> String {
        let base = self
            .program
            .rsplit('/')
            .next()
            .unwrap_or(&self.program)
            .to_string();
        match self.elevation {
            Elevation::NonInteractiveSudo => format!("sudo {base}"),
            _ => base,
        }
    }

    /// The unelevated command as one shell line, environment assignments first.
    pub fn shell_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }

    /// Program and arguments actually executed once elevation is applied.
    pub fn argv(&self) -> (String, Vec<String>) {
        match self.elevation {
            Elevation::None => (self.program.clone(), self.args.clone()),
            Elevation::NonInteractiveSudo => {
                let mut args = vec!["-n".to_string(), self.program.clone()];
                args.extend(self.args.iter().cloned());
                ("sudo".to_string(), args)
            }
            Elevation::Administrator | Elevation::AppleScript => {
                let admin = self.elevation == Elevation::Administrator;
                (
                    "osascript".to_string(),
                    vec!["-e".to_string(), apple_script(&self.shell_line(), admin)],
                )
            }
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (program, args) = self.argv();
        write!(f, "{program}")?;
        for a in args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout and stderr together, for tools that report on either stream.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs external commands with a bounded timeout.
pub trait CommandRunner: Send + Sync {
    /// Run to completion or until the deadline. Non-zero exit is not an error
    /// here; see [`CommandRunner::stdout`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError>;

    /// Trimmed stdout of a successful run with non-empty output.
    fn stdout(&self, spec: &CommandSpec) -> Result<String, ProbeError> {
        let out = self.run(spec)?;
        if !out.success {
            let code = out
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ProbeError::crashed(
                spec.label(),
                format!("exit status {code}"),
            ));
        }
        let text = out.stdout.trim();
        if text.is_empty() {
            return Err(ProbeError::unavailable(format!(
                "{} produced no output",
                spec.label()
            )));
        }
        Ok(text.to_string())
    }

    /// Resolve a program on `PATH` via `which`.
    fn which(&self, name: &str) -> Option<String> {
        let spec = CommandSpec::new("which")
            .arg(name)
            .timeout(Duration::from_secs(1));
        self.stdout(&spec)
            .ok()
            .and_then(|s| s.lines().next().map(str::to_string))
    }

    fn command_exists(&self, name: &str) -> bool {
        self.which(name).is_some()
    }
}

/// Runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError> {
        let (program, args) = spec.argv();
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !matches!(
            spec.elevation,
            Elevation::Administrator | Elevation::AppleScript
        ) {
            cmd.envs(&spec.env);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProbeError::unavailable(format!("{program} not found"))
            } else {
                ProbeError::crashed(spec.label(), format!("failed to start: {e}"))
            }
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() >= spec.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ProbeError::Timeout {
                            source_name: spec.label(),
                            after: spec.timeout,
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(ProbeError::crashed(spec.label(), format!("wait failed: {e}")));
                }
            }
        };

        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            stdout: stdout.map(join_lossy).unwrap_or_default(),
            stderr: stderr.map(join_lossy).unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_lossy(handle: thread::JoinHandle<Vec<u8>>) -> String {
    handle
        .join()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Single-quote for `/bin/sh` unless the word is plainly safe.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Escape text for embedding in an AppleScript string literal.
pub fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn apple_script(shell_line: &str, admin: bool) -> String {
    let mut script = format!("do shell script \"{}\"", escape_applescript(shell_line));
    if admin {
        script.push_str(" with administrator privileges");
    }
    script
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner shared by probe and bootstrap tests.

    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, ProbeError> + Send + Sync>;

    /// Answers commands by matching on their rendered command line.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Vec<(String, Responder)>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Respond to any command line containing `needle`. Earlier rules win.
        pub fn on<F>(mut self, needle: &str, respond: F) -> Self
        where
            F: Fn(&CommandSpec) -> Result<CommandOutput, ProbeError> + Send + Sync + 'static,
        {
            self.rules.push((needle.to_string(), Box::new(respond)));
            self
        }

        pub fn stdout(self, needle: &str, text: &'static str) -> Self {
            self.on(needle, move |_| Ok(CommandOutput::ok(text)))
        }

        pub fn calls_matching(&self, needle: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.contains(needle))
                .count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProbeError> {
            let line = spec.to_string();
            self.calls.lock().unwrap().push(line.clone());
            for (needle, respond) in &self.rules {
                if line.contains(needle.as_str()) {
                    return respond(spec);
                }
            }
            Err(ProbeError::unavailable(format!("{} not found", spec.program)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_applies_elevation() {
        let spec = CommandSpec::new("/usr/bin/powermetrics")
            .args(["--samplers", "gpu_power"])
            .elevated(Elevation::NonInteractiveSudo);
        let (program, args) = spec.argv();
        assert_eq!(program, "sudo");
        assert_eq!(args[..2], ["-n".to_string(), "/usr/bin/powermetrics".to_string()]);
        assert_eq!(spec.label(), "sudo powermetrics");
    }

    #[test]
    fn administrator_wraps_in_applescript() {
        let spec = CommandSpec::new("/bin/sh")
            .args(["-c", r#"echo "hi" > /tmp/x"#])
            .elevated(Elevation::Administrator);
        let (program, args) = spec.argv();
        assert_eq!(program, "osascript");
        assert_eq!(args[0], "-e");
        assert!(args[1].starts_with("do shell script \""));
        assert!(args[1].ends_with("with administrator privileges"));
        assert!(args[1].contains(r#"\"hi\""#));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/opt/homebrew/bin/brew"), "/opt/homebrew/bin/brew");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(escape_applescript(r#"a\b"c"#), r#"a\\b\"c"#);
    }

    #[test]
    fn shell_line_puts_env_first() {
        let spec = CommandSpec::new("brew")
            .args(["install", "smartmontools"])
            .env("HOMEBREW_NO_AUTO_UPDATE", "1");
        assert_eq!(
            spec.shell_line(),
            "HOMEBREW_NO_AUTO_UPDATE=1 brew install smartmontools"
        );
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_stdout() {
        let out = SystemCommandRunner
            .stdout(&CommandSpec::new("echo").arg("hello"))
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_times_out() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = SystemCommandRunner.run(&spec).unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let err = SystemCommandRunner
            .run(&CommandSpec::new("/nonexistent/binary_xyz_12345"))
            .unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_crash_for_stdout() {
        let err = SystemCommandRunner
            .stdout(&CommandSpec::new("false"))
            .unwrap_err();
        assert!(matches!(err, ProbeError::Crashed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn which_finds_sh() {
        assert!(SystemCommandRunner.command_exists("sh"));
        assert!(!SystemCommandRunner.command_exists("nonexistent_binary_xyz_12345"));
    }
}
