use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;

/// Program, arguments and extra environment of one external probe.
///
/// Commands are spawned directly, never through a shell, so paths coming
/// from configuration cannot be interpreted as shell syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Treat an `error` line on stdout of a zero exit as a daemon failure.
    /// Off for listings, where block names and CIDs may contain the word.
    pub error_marker: bool,
}

impl ProbeCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            error_marker: false,
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
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_error_marker(mut self) -> Self {
        self.error_marker = true;
        self
    }
}

impl fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.envs {
            write!(f, "{key}={value} ")?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("daemon reported an error: {0}")]
    DaemonError(String),
    #[error("command failed: {0}")]
    Exec(String),
}

impl ProbeFailure {
    /// Stable label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout(_) => "timeout",
            ProbeFailure::DaemonError(_) => "daemon-error",
            ProbeFailure::Exec(_) => "exec-error",
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ProbeFailure>> + Send + 'a>>;

/// The only way collectors reach external processes. Every call carries its
/// own wall-clock timeout.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, cmd: &'a ProbeCommand, timeout: Duration) -> ProbeFuture<'a>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, cmd: &'a ProbeCommand, timeout: Duration) -> ProbeFuture<'a> {
        Box::pin(run_process(cmd, timeout))
    }
}

async fn run_process(cmd: &ProbeCommand, timeout: Duration) -> Result<String, ProbeFailure> {
    let child = Command::new(&cmd.program)
        .args(&cmd.args)
        .envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // dropping the wait future on timeout kills the child
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ProbeFailure::Exec(format!("{}: {err}", cmd.program)))?;

    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(ProbeFailure::Exec(format!("{}: {err}", cmd.program))),
        Err(_) => return Err(ProbeFailure::Timeout(timeout)),
    };

    classify(
        cmd.error_marker,
        output.status.success(),
        output.status.code(),
        &output.stdout,
        &output.stderr,
    )
}

fn classify(
    error_marker: bool,
    success: bool,
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<String, ProbeFailure> {
    if !success {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            match code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            stderr
        };
        return Err(ProbeFailure::Exec(detail));
    }

    let stdout = String::from_utf8_lossy(stdout).into_owned();
    if error_marker {
        if let Some(line) = stdout
            .lines()
            .find(|line| line.to_ascii_uppercase().contains("ERROR"))
        {
            return Err(ProbeFailure::DaemonError(line.trim().to_string()));
        }
    }
    Ok(stdout)
}


/// In-memory runner for collector tests: answers by substring match on the
/// rendered command line and records every call.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Vec<(String, Result<String, ProbeFailure>)>,
        panics: Vec<String>,
        calls: Mutex<Vec<ProbeCommand>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ok(mut self, needle: &str, stdout: &str) -> Self {
            self.responses.push((needle.to_string(), Ok(stdout.to_string())));
            self
        }

        pub fn fail(mut self, needle: &str, failure: ProbeFailure) -> Self {
            self.responses.push((needle.to_string(), Err(failure)));
            self
        }

        /// Makes the collector task issuing a matching command panic.
        pub fn panic_on(mut self, needle: &str) -> Self {
            self.panics.push(needle.to_string());
            self
        }

        pub fn commands(&self) -> Vec<ProbeCommand> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(ToString::to_string)
                .collect()
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.program.clone())
                .collect()
        }
    }

    async fn scripted_panic(line: String) -> Result<String, ProbeFailure> {
        panic!("scripted panic: {line}")
    }

    impl CommandRunner for ScriptedRunner {
        fn run<'a>(&'a self, cmd: &'a ProbeCommand, _timeout: Duration) -> ProbeFuture<'a> {
            self.calls.lock().unwrap().push(cmd.clone());
            let line = cmd.to_string();
            if self.panics.iter().any(|needle| line.contains(needle.as_str())) {
                return Box::pin(scripted_panic(line));
            }
            let response = self
                .responses
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| Err(ProbeFailure::Exec(format!("unscripted: {line}"))));
            Box::pin(async move { response })
        }
    }
}
