use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Environment overlay applied on top of the ambient environment
pub type Environment = BTreeMap<String, String>;

/// The command a supervised process executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandLine {
    /// A single string handed to `sh -c`
    Shell(String),
    /// An argument vector executed directly, without a shell
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn shell(command: impl Into<String>) -> Self {
        CommandLine::Shell(command.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Name of the program that will be exec'd, used in error messages
    pub fn program(&self) -> &str {
        match self {
            CommandLine::Shell(_) => "sh",
            CommandLine::Argv(args) => args.first().map(String::as_str).unwrap_or(""),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        CommandLine::Shell(s.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(s: String) -> Self {
        CommandLine::Shell(s)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(args: Vec<String>) -> Self {
        CommandLine::Argv(args)
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(args: Vec<&str>) -> Self {
        CommandLine::argv(args)
    }
}

impl<const N: usize> From<[&str; N]> for CommandLine {
    fn from(args: [&str; N]) -> Self {
        CommandLine::argv(args)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(command) => write!(f, "{}", command),
            CommandLine::Argv(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// A signal given by name (`"TERM"`, `"SIGTERM"`) or by number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSpec {
    Name(String),
    Number(i32),
}

impl From<&str> for SignalSpec {
    fn from(s: &str) -> Self {
        SignalSpec::Name(s.to_string())
    }
}

impl From<String> for SignalSpec {
    fn from(s: String) -> Self {
        SignalSpec::Name(s)
    }
}

impl From<i32> for SignalSpec {
    fn from(n: i32) -> Self {
        SignalSpec::Number(n)
    }
}

impl fmt::Display for SignalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSpec::Name(name) => write!(f, "{}", name),
            SignalSpec::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Error type returned by escalation callbacks
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Escalation callback, invoked with the child's pid
pub type ActionCallback = Arc<dyn Fn(u32) -> Result<(), CallbackError> + Send + Sync>;

/// What to do when a deadline passes and the child is still running
#[derive(Clone)]
pub enum Action {
    /// Deliver a signal to the child
    Signal(SignalSpec),
    /// Run caller logic with the child's pid
    Callback(ActionCallback),
    /// Kill the child (SIGKILL). Implied by a bare numeric timeout.
    Terminal,
}

impl Action {
    pub fn signal(signal: impl Into<SignalSpec>) -> Self {
        Action::Signal(signal.into())
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(u32) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Action::Callback(Arc::new(f))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Action::Callback(_) => f.write_str("Callback(<fn>)"),
            Action::Terminal => f.write_str("Terminal"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Signal(signal) => write!(f, "{}", signal),
            Action::Callback(_) => write!(f, "callback"),
            Action::Terminal => write!(f, "KILL"),
        }
    }
}

/// One `(seconds, action)` entry of an escalating timeout
#[derive(Debug, Clone)]
pub struct TimeoutStep {
    pub after: f64,
    pub action: Action,
}

/// Caller-supplied timeout. Absence (`None` at the call site) means no deadline.
///
/// Durations are plain seconds; they are validated when the run starts,
/// before anything is spawned.
#[derive(Debug, Clone)]
pub enum TimeoutSpec {
    /// Kill the child after this many seconds
    After(f64),
    /// Fire each action once its offset has elapsed, in ascending offset order
    /// regardless of the order given here
    Steps(Vec<TimeoutStep>),
}

impl TimeoutSpec {
    pub fn after_secs(secs: f64) -> Self {
        TimeoutSpec::After(secs)
    }

    pub fn escalate<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = (f64, Action)>,
    {
        TimeoutSpec::Steps(
            steps
                .into_iter()
                .map(|(after, action)| TimeoutStep { after, action })
                .collect(),
        )
    }

    /// Appends another step, turning a bare timeout into its explicit
    /// `Terminal` step first
    pub fn then(self, after: f64, action: Action) -> Self {
        let mut steps = match self {
            TimeoutSpec::After(secs) => vec![TimeoutStep {
                after: secs,
                action: Action::Terminal,
            }],
            TimeoutSpec::Steps(steps) => steps,
        };
        steps.push(TimeoutStep { after, action });
        TimeoutSpec::Steps(steps)
    }
}

impl From<Duration> for TimeoutSpec {
    fn from(d: Duration) -> Self {
        TimeoutSpec::After(d.as_secs_f64())
    }
}

impl fmt::Display for TimeoutSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutSpec::After(secs) => write!(f, "{}", secs),
            TimeoutSpec::Steps(steps) => {
                let items: Vec<String> = steps
                    .iter()
                    .map(|s| format!("{} => {}", s.after, s.action))
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

/// Where the child's stdout goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StdoutMode {
    #[default]
    Capture,
    Discard,
}

/// Where the child's stderr goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StderrMode {
    /// Into the same pipe as stdout (discarded along with it if stdout is)
    #[default]
    Merge,
    /// Into its own pipe and its own buffer
    Split,
    Discard,
}

/// Stream redirection and spawn options for a supervised run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub stdout: StdoutMode,
    pub stderr: StderrMode,
    pub working_directory: Option<PathBuf>,
    pub process_group: Option<i32>,
    /// Longest the supervisor waits between exit/deadline checks
    pub tick: Duration,
}

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stdout: StdoutMode::Capture,
            stderr: StderrMode::Merge,
            working_directory: None,
            process_group: None,
            tick: DEFAULT_TICK,
        }
    }
}

impl RunOptions {
    pub fn split_stderr(mut self) -> Self {
        self.stderr = StderrMode::Split;
        self
    }

    pub fn discard_stderr(mut self) -> Self {
        self.stderr = StderrMode::Discard;
        self
    }

    pub fn discard_stdout(mut self) -> Self {
        self.stdout = StdoutMode::Discard;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_process_group(mut self, pgid: i32) -> Self {
        self.process_group = Some(pgid);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(_) => None,
            ExitStatus::Signaled(signal) => Some(*signal),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "code: {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal: {}", signal),
        }
    }
}

/// Everything a supervised run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub pid: u32,
    /// Combined stdout and stderr, or stdout alone in split mode
    pub output: Vec<u8>,
    /// Present only when stderr was captured separately
    pub stderr: Option<Vec<u8>>,
    pub status: ExitStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }

    pub fn stderr_lossy(&self) -> Option<String> {
        self.stderr
            .as_ref()
            .map(|err| String::from_utf8_lossy(err).to_string())
    }
}

/// A sub-argument passed to a command template.
///
/// Equality is exact: `Text("test")` and `Symbol("test")` are different
/// values, which matters for allow-list checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubArg {
    Text(String),
    Symbol(String),
    Integer(i64),
    /// A boxed argument list; only valid as the sole argument
    List(Vec<SubArg>),
}

impl SubArg {
    pub fn symbol(name: impl Into<String>) -> Self {
        SubArg::Symbol(name.into())
    }

    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<SubArg>,
    {
        SubArg::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for SubArg {
    fn from(s: &str) -> Self {
        SubArg::Text(s.to_string())
    }
}

impl From<String> for SubArg {
    fn from(s: String) -> Self {
        SubArg::Text(s)
    }
}

impl From<i64> for SubArg {
    fn from(n: i64) -> Self {
        SubArg::Integer(n)
    }
}

impl fmt::Display for SubArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubArg::Text(s) | SubArg::Symbol(s) => write!(f, "{}", s),
            SubArg::Integer(n) => write!(f, "{}", n),
            SubArg::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

/// Serialized form of a command template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub argv: Vec<String>,
    /// Textual timeout spec, e.g. `"10"` or `"2:TERM,5:KILL"`
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub allowed_sub_commands: Vec<String>,
    #[serde(default)]
    pub split_stderr: bool,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}
