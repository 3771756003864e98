//! Runs a package script as a child process and exposes its output streams
//!
//! The script is executed through the platform's package-script convention
//! (`npm run <script> -- <args>` by default). Both output streams are wrapped
//! in [`EventedStreamReader`]s which any number of consumers may subscribe to.

use crate::config::DevServerConfig;
use crate::error::StartupError;
use crate::stream::EventedStreamReader;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// How the package manager is started on a particular OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPolicy {
    /// Shell (and its leading arguments) the package manager is run through
    pub shell: Option<(&'static str, &'static [&'static str])>,
}

/// Package managers ship as `.cmd` shims on Windows, which cannot be spawned directly
const LAUNCH_POLICIES: &[(&str, LaunchPolicy)] = &[(
    "windows",
    LaunchPolicy {
        shell: Some(("cmd", &["/c"])),
    },
)];

const DIRECT_LAUNCH: LaunchPolicy = LaunchPolicy { shell: None };

impl LaunchPolicy {
    /// Look up the policy for an OS name as reported by `std::env::consts::OS`
    pub fn for_os(os: &str) -> Self {
        LAUNCH_POLICIES
            .iter()
            .find(|(name, _)| *name == os)
            .map(|(_, policy)| *policy)
            .unwrap_or(DIRECT_LAUNCH)
    }

    /// Policy for the OS this binary was built for
    pub fn current() -> Self {
        Self::for_os(std::env::consts::OS)
    }

    /// Build the program and argument list that runs `script`
    pub fn invocation(
        &self,
        package_manager: &str,
        run_command: &[String],
        script: &str,
        args: &[String],
    ) -> (String, Vec<String>) {
        let mut argv = Vec::new();
        let program = match self.shell {
            Some((shell, prefix)) => {
                argv.extend(prefix.iter().map(|s| s.to_string()));
                argv.push(package_manager.to_string());
                shell.to_string()
            }
            None => package_manager.to_string(),
        };

        argv.extend(run_command.iter().cloned());
        argv.push(script.to_string());
        if !args.is_empty() {
            argv.push("--".to_string());
            argv.extend(args.iter().cloned());
        }

        (program, argv)
    }
}

fn ansi_color_regex() -> &'static Regex {
    static ANSI_COLOR: OnceLock<Regex> = OnceLock::new();
    ANSI_COLOR.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ANSI color pattern"))
}

/// Remove ANSI color escape sequences from `text`
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_color_regex().replace_all(text, "")
}

/// Destination for a script's output
pub trait LogSink: Send + Sync + 'static {
    /// A complete stdout line
    fn info(&self, line: &str);
    /// A complete stderr line
    fn error(&self, line: &str);
    /// A stderr chunk with no line break, typically an in-place progress indicator.
    /// Decided per read: a read holding any line break is logged as lines only.
    fn passthrough(&self, chunk: &[u8]);
}

/// Sends script output to `tracing`, and progress chunks to our own stderr
#[derive(Debug, Clone)]
pub struct TracingSink {
    script: String,
}

impl TracingSink {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl LogSink for TracingSink {
    fn info(&self, line: &str) {
        info!(script = %self.script, "{}", line);
    }

    fn error(&self, line: &str) {
        error!(script = %self.script, "{}", line);
    }

    fn passthrough(&self, chunk: &[u8]) {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(chunk);
        let _ = stderr.flush();
    }
}

/// A running package script and its output streams
pub struct ScriptRunner {
    script: String,
    child: Child,
    stdout: EventedStreamReader,
    stderr: EventedStreamReader,
}

impl ScriptRunner {
    /// Spawn `config.script` with the extra `args` and the environment overlay `env`.
    ///
    /// Output is not read until [`start_streaming`](Self::start_streaming) is called,
    /// so subscribers can be attached first. The child is killed if the runner is
    /// dropped.
    pub fn launch(
        config: &DevServerConfig,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        if !Path::new(&config.source_path).is_dir() {
            return Err(StartupError::InvalidConfiguration(format!(
                "source path '{}' is not a directory",
                config.source_path
            )));
        }

        let (program, argv) = LaunchPolicy::current().invocation(
            &config.package_manager,
            &config.run_command,
            &config.script,
            args,
        );

        info!(
            script = %config.script,
            program = %program,
            args = ?argv,
            cwd = %config.source_path,
            "Starting dev server script"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&argv);
        cmd.current_dir(&config.source_path);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let launch_failure = |source: std::io::Error| StartupError::LaunchFailure {
            program: config.package_manager.clone(),
            path: std::env::var("PATH").unwrap_or_default(),
            source,
        };

        let mut child = cmd.spawn().map_err(launch_failure)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failure(std::io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_failure(std::io::Error::other("stderr was not captured")))?;

        info!(script = %config.script, pid = child.id().unwrap_or(0), "Dev server process spawned");

        Ok(Self {
            script: config.script.clone(),
            child,
            stdout: EventedStreamReader::new("stdout", stdout),
            stderr: EventedStreamReader::new("stderr", stderr),
        })
    }

    pub fn stdout(&self) -> &EventedStreamReader {
        &self.stdout
    }

    pub fn stderr(&self) -> &EventedStreamReader {
        &self.stderr
    }

    /// Begin reading both output streams
    pub fn start_streaming(&self) {
        self.stdout.start();
        self.stderr.start();
    }

    /// Forward complete lines to `sink` with colors stripped. Stderr chunks
    /// without a line break go to [`LogSink::passthrough`] verbatim.
    pub fn attach_to_logger(&self, sink: Arc<dyn LogSink>) {
        let stdout_sink = Arc::clone(&sink);
        self.stdout
            .on_line(move |line| stdout_sink.info(&strip_ansi(line)));

        let stderr_sink = Arc::clone(&sink);
        self.stderr
            .on_line(move |line| stderr_sink.error(&strip_ansi(line)));

        self.stderr.on_chunk(move |chunk| {
            if is_progress_chunk(chunk) {
                sink.passthrough(chunk);
            }
        });
    }

    /// Stop the script: SIGTERM (or kill on non-Unix), then SIGKILL after `grace_period`
    pub async fn shutdown(mut self, grace_period: Duration) {
        if let Some(pid) = self.child.id() {
            info!(script = %self.script, pid, "Sending SIGTERM to dev server");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(script = %self.script, ?status, "Dev server exited");
            }
            Ok(Err(e)) => {
                warn!(script = %self.script, error = %e, "Error waiting for dev server to exit");
            }
            Err(_) => {
                warn!(
                    script = %self.script,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

/// A read without any line break, such as a progress bar redrawn in place
fn is_progress_chunk(chunk: &[u8]) -> bool {
    !chunk.is_empty() && !chunk.contains(&b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MatchError;
    use parking_lot::Mutex;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unix_invocation_runs_package_manager_directly() {
        let (program, args) = LaunchPolicy::for_os("linux").invocation(
            "npm",
            &strings(&["run"]),
            "start",
            &strings(&["--port", "5173"]),
        );

        assert_eq!(program, "npm");
        assert_eq!(args, strings(&["run", "start", "--", "--port", "5173"]));
        assert_eq!(LaunchPolicy::for_os("macos"), LaunchPolicy::for_os("linux"));
    }

    #[test]
    fn test_windows_invocation_goes_through_cmd() {
        let (program, args) =
            LaunchPolicy::for_os("windows").invocation("npm", &strings(&["run"]), "start", &[]);

        assert_eq!(program, "cmd");
        assert_eq!(args, strings(&["/c", "npm", "run", "start"]));
    }

    #[test]
    fn test_strip_ansi_removes_colors() {
        assert_eq!(strip_ansi("\x1b[31mERROR\x1b[0m"), "ERROR");
        assert_eq!(strip_ansi("\x1b[1;32m✔\x1b[39;22m compiled"), "✔ compiled");
    }

    #[test]
    fn test_strip_ansi_is_idempotent() {
        let plain = "Local: http://localhost:5173/";
        assert_eq!(strip_ansi(plain), plain);
        assert!(matches!(strip_ansi(plain), Cow::Borrowed(_)));

        let once = strip_ansi("\x1b[36mready\x1b[0m").into_owned();
        assert_eq!(strip_ansi(&once), once);
    }

    #[tokio::test]
    async fn test_launch_rejects_empty_script() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevServerConfig::new(dir.path().to_str().unwrap(), "");

        let result = ScriptRunner::launch(&config, &[], &HashMap::new());
        assert!(matches!(result, Err(StartupError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_launch_rejects_empty_source_path() {
        let config = DevServerConfig::new("", "start");

        let result = ScriptRunner::launch(&config, &[], &HashMap::new());
        assert!(matches!(result, Err(StartupError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_launch_rejects_missing_directory() {
        let config = DevServerConfig::new("/definitely/not/a/real/dir", "start");

        let result = ScriptRunner::launch(&config, &[], &HashMap::new());
        let err = result.err().expect("missing directory should fail");
        assert!(err.to_string().contains("/definitely/not/a/real/dir"));
    }

    #[tokio::test]
    async fn test_launch_failure_explains_remediation() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevServerConfig::new(dir.path().to_str().unwrap(), "start")
            .with_package_manager("devgate-no-such-package-manager", vec!["run".to_string()]);

        let err = match ScriptRunner::launch(&config, &[], &HashMap::new()) {
            Err(e) => e,
            Ok(_) => panic!("launch should fail for a missing executable"),
        };

        assert!(matches!(err, StartupError::LaunchFailure { .. }));
        let message = err.to_string();
        assert!(message.contains("devgate-no-such-package-manager"));
        assert!(message.contains("PATH"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[derive(Default)]
    struct RecordingSink {
        info: Mutex<Vec<String>>,
        error: Mutex<Vec<String>>,
        passthrough: Mutex<Vec<u8>>,
    }

    impl LogSink for RecordingSink {
        fn info(&self, line: &str) {
            self.info.lock().push(line.to_string());
        }
        fn error(&self, line: &str) {
            self.error.lock().push(line.to_string());
        }
        fn passthrough(&self, chunk: &[u8]) {
            self.passthrough.lock().extend_from_slice(chunk);
        }
    }

    #[test]
    fn test_progress_chunks_are_whole_reads_without_newline() {
        assert!(is_progress_chunk(b"building 40%"));
        assert!(is_progress_chunk(b"\rbuilding 41%"));
        assert!(!is_progress_chunk(b"warn: slow\n"));
        assert!(!is_progress_chunk(b"warn\nbuilding 40%"));
        assert!(!is_progress_chunk(b""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_to_logger_routes_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dev.sh"),
            "printf '\\033[32mcompiled\\033[0m\\n'\n\
             echo 'warning: deprecated' >&2\n\
             sleep 0.3\n\
             printf 'building 50%%' >&2\n\
             sleep 0.3\n",
        )
        .unwrap();

        let config = DevServerConfig::new(dir.path().to_str().unwrap(), "dev.sh")
            .with_package_manager("sh", Vec::new());
        let runner = ScriptRunner::launch(&config, &[], &HashMap::new()).unwrap();

        let sink = Arc::new(RecordingSink::default());
        runner.attach_to_logger(sink.clone());
        let never = Regex::new("never printed").unwrap();
        let stdout_end = runner
            .stdout()
            .wait_for_match(never.clone(), Duration::from_secs(10));
        let stderr_end = runner
            .stderr()
            .wait_for_match(never, Duration::from_secs(10));
        runner.start_streaming();

        assert_eq!(stdout_end.await, Err(MatchError::EndOfStream));
        assert_eq!(stderr_end.await, Err(MatchError::EndOfStream));

        assert_eq!(*sink.info.lock(), vec!["compiled"]);
        assert_eq!(
            *sink.error.lock(),
            vec!["warning: deprecated", "building 50%"]
        );
        assert_eq!(sink.passthrough.lock().as_slice(), b"building 50%");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_overlay_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("env.sh"), "echo \"port=$PORT args=$*\"\n").unwrap();

        let config = DevServerConfig::new(dir.path().to_str().unwrap(), "env.sh")
            .with_package_manager("sh", Vec::new());
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), "4321".to_string());
        let runner =
            ScriptRunner::launch(&config, &strings(&["--host", "localhost"]), &env).unwrap();

        let line = runner.stdout().wait_for_match(
            Regex::new(r"port=\S+ args=.*").unwrap(),
            Duration::from_secs(10),
        );
        runner.start_streaming();

        assert_eq!(
            line.await,
            Ok("port=4321 args=-- --host localhost".to_string())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("forever.sh"), "echo started\nexec sleep 60\n").unwrap();

        let config = DevServerConfig::new(dir.path().to_str().unwrap(), "forever.sh")
            .with_package_manager("sh", Vec::new());
        let runner = ScriptRunner::launch(&config, &[], &HashMap::new()).unwrap();
        assert!(runner.child.id().is_some());

        let started = runner
            .stdout()
            .wait_for_match(Regex::new("started").unwrap(), Duration::from_secs(10));
        runner.start_streaming();
        assert!(started.await.is_ok());

        let stdout = runner.stdout().clone();
        tokio::time::timeout(Duration::from_secs(5), runner.shutdown(Duration::from_secs(2)))
            .await
            .expect("shutdown should finish within the grace period");

        let end = stdout.wait_for_match(Regex::new("never").unwrap(), Duration::from_secs(5));
        assert_eq!(end.await, Err(MatchError::EndOfStream));
    }
}
