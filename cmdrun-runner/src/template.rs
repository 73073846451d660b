use crate::debug::DebugLog;
use crate::supervisor::ProcessSupervisor;
use cmdrun_core::{
    CmdrunError, CommandLine, CommandResult, Environment, Result, RunOptions, SubArg,
    TemplateConfig, TimeoutSpec,
};
use cmdrun_parser::{parse_template_config, parse_timeout_spec};
use tracing::debug;

/// Defaults bound into a CommandTemplate
#[derive(Debug, Clone, Default)]
pub struct TemplateDefaults {
    pub timeout: Option<TimeoutSpec>,
    pub environment: Environment,
    /// First sub-argument must equal one of these. Empty allows anything.
    pub allowed_sub_commands: Vec<SubArg>,
    pub debug_log: Option<DebugLog>,
    pub options: RunOptions,
}

/// Per-call overrides for CommandTemplate::run
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Replaces the template's default timeout when set
    pub timeout: Option<TimeoutSpec>,
    /// Layered over the template's environment, per key
    pub environment: Environment,
}

/// A command prefix plus defaults, run many times with different sub-arguments.
///
/// ```no_run
/// # async fn demo() -> cmdrun_core::Result<()> {
/// use cmdrun_core::{SubArg, TimeoutSpec};
/// use cmdrun_runner::{CommandTemplate, TemplateDefaults};
///
/// let git = CommandTemplate::bind(
///     ["sudo", "git"],
///     TemplateDefaults {
///         timeout: Some(TimeoutSpec::after_secs(10.0)),
///         allowed_sub_commands: vec![SubArg::symbol("pull"), SubArg::symbol("push")],
///         ..Default::default()
///     },
/// )?;
/// git.run_args([SubArg::symbol("pull"), "origin".into(), "master".into()]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    fixed_argv: Vec<String>,
    default_timeout: Option<TimeoutSpec>,
    default_environment: Environment,
    allowed_sub_commands: Vec<SubArg>,
    debug_log: Option<DebugLog>,
    options: RunOptions,
}

impl CommandTemplate {
    /// Bind a fixed argument vector. Shell strings are rejected since
    /// sub-arguments could not be appended to them unambiguously.
    pub fn bind(fixed: impl Into<CommandLine>, defaults: TemplateDefaults) -> Result<Self> {
        let fixed_argv = match fixed.into() {
            CommandLine::Argv(args) if !args.is_empty() => args,
            CommandLine::Argv(_) => {
                return Err(CmdrunError::InvalidConfiguration(
                    "Template argv must name at least the program".to_string(),
                ))
            }
            CommandLine::Shell(command) => {
                return Err(CmdrunError::InvalidConfiguration(format!(
                    "Template needs an argument vector, found shell string '{}'",
                    command
                )))
            }
        };

        Ok(Self {
            fixed_argv,
            default_timeout: defaults.timeout,
            default_environment: defaults.environment,
            allowed_sub_commands: defaults.allowed_sub_commands,
            debug_log: defaults.debug_log,
            options: defaults.options,
        })
    }

    pub fn from_config(config: &TemplateConfig) -> Result<Self> {
        let timeout = config
            .timeout
            .as_deref()
            .map(parse_timeout_spec)
            .transpose()?;

        let mut options = RunOptions::default();
        if config.split_stderr {
            options = options.split_stderr();
        }
        if let Some(dir) = &config.working_directory {
            options = options.with_working_directory(dir.clone());
        }

        Self::bind(
            CommandLine::Argv(config.argv.clone()),
            TemplateDefaults {
                timeout,
                environment: config.environment.clone(),
                allowed_sub_commands: config
                    .allowed_sub_commands
                    .iter()
                    .cloned()
                    .map(SubArg::Text)
                    .collect(),
                debug_log: None,
                options,
            },
        )
    }

    /// Build a template from a TOML document
    pub fn from_toml(input: &str) -> Result<Self> {
        Self::from_config(&parse_template_config(input)?)
    }

    pub fn with_debug_log(mut self, debug_log: DebugLog) -> Self {
        self.debug_log = Some(debug_log);
        self
    }

    pub fn fixed_argv(&self) -> &[String] {
        &self.fixed_argv
    }

    pub fn allowed_sub_commands(&self) -> &[SubArg] {
        &self.allowed_sub_commands
    }

    /// Run with the template's defaults
    pub async fn run_args<I, A>(&self, sub_args: I) -> Result<CommandResult>
    where
        I: IntoIterator<Item = A>,
        A: Into<SubArg>,
    {
        self.run(sub_args, RunOverrides::default()).await
    }

    /// Run the bare prefix with no sub-arguments
    pub async fn run_bare(&self) -> Result<CommandResult> {
        self.run(Vec::<SubArg>::new(), RunOverrides::default()).await
    }

    /// Append `sub_args` to the fixed argv and run it.
    ///
    /// `sub_args` is either a flat list or a single boxed [`SubArg::List`].
    pub async fn run<I, A>(&self, sub_args: I, overrides: RunOverrides) -> Result<CommandResult>
    where
        I: IntoIterator<Item = A>,
        A: Into<SubArg>,
    {
        let args = unbox(sub_args.into_iter().map(Into::into).collect())?;
        self.check_sub_command(&args)?;

        let mut argv = self.fixed_argv.clone();
        argv.extend(args.iter().map(ToString::to_string));

        let mut environment = self.default_environment.clone();
        environment.extend(overrides.environment);

        let timeout = overrides.timeout.or_else(|| self.default_timeout.clone());

        debug!(argv = ?argv, "Running command template");

        let mut supervisor = ProcessSupervisor::new()
            .with_timeout(timeout)
            .with_environment(environment)
            .with_options(self.options.clone());
        if let Some(debug_log) = &self.debug_log {
            supervisor = supervisor.with_debug_log(debug_log.clone());
        }

        supervisor.run(CommandLine::Argv(argv)).await
    }

    fn check_sub_command(&self, args: &[SubArg]) -> Result<()> {
        let Some(first) = args.first() else {
            return Ok(());
        };

        if self.allowed_sub_commands.is_empty() || self.allowed_sub_commands.contains(first) {
            return Ok(());
        }

        Err(CmdrunError::SubCommandNotAllowed {
            sub_command: first.clone(),
            allowed: self.allowed_sub_commands.clone(),
        })
    }
}

fn unbox(mut args: Vec<SubArg>) -> Result<Vec<SubArg>> {
    if matches!(args.first(), Some(SubArg::List(_))) {
        if args.len() > 1 {
            return Err(CmdrunError::Usage(format!(
                "A boxed argument list must be the only argument, got {} arguments",
                args.len()
            )));
        }
        if let Some(SubArg::List(items)) = args.pop() {
            args = items;
        }
    }

    if args.iter().any(|arg| matches!(arg, SubArg::List(_))) {
        return Err(CmdrunError::Usage(
            "Boxed argument lists cannot be mixed with plain arguments".to_string(),
        ));
    }

    Ok(args)
}
