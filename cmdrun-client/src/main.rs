use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cmdrun_core::{CommandLine, CommandResult, Environment, ExitStatus, RunOptions, SubArg};
use cmdrun_parser::parse_timeout_spec;
use cmdrun_runner::{CommandTemplate, DebugLog, ProcessSupervisor, RunOverrides};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmdrun")]
#[command(about = "Run commands under escalating timeouts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a program directly, without a shell
    Exec {
        #[command(flatten)]
        run: RunArgs,

        /// Program followed by its arguments
        #[arg(required = true, last = true)]
        argv: Vec<String>,
    },

    /// Execute a command string with `sh -c`
    Sh {
        #[command(flatten)]
        run: RunArgs,

        /// Command string handed to the shell
        command: String,
    },

    /// Run a TOML command template with extra sub-arguments
    Template {
        /// Path to the template document
        config: PathBuf,

        /// Timeout, e.g. `10` or `2:TERM, 5:KILL` (overrides the template's)
        #[arg(short, long)]
        timeout: Option<String>,

        /// Extra environment variable, layered over the template's
        #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Print a JSON summary instead of the raw output
        #[arg(long)]
        json: bool,

        /// Emit supervisor debug lines through the log
        #[arg(long)]
        debug: bool,

        /// Sub-arguments appended to the template's argv
        #[arg(last = true)]
        sub_args: Vec<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Timeout, e.g. `10`, `1.5s` or `2:TERM, 5:KILL`
    #[arg(short, long)]
    timeout: Option<String>,

    /// Environment variable for the child (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Capture stderr separately instead of merging it into stdout
    #[arg(long, conflicts_with = "discard_stderr")]
    split_stderr: bool,

    /// Send stderr to /dev/null
    #[arg(long)]
    discard_stderr: bool,

    /// Working directory for the child
    #[arg(short = 'C', long = "directory")]
    directory: Option<PathBuf>,

    /// Print a JSON summary instead of the raw output
    #[arg(long)]
    json: bool,

    /// Emit supervisor debug lines through the log
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let debug = match &cli.command {
        Commands::Exec { run, .. } | Commands::Sh { run, .. } => run.debug,
        Commands::Template { debug, .. } => *debug,
    };
    init_tracing(debug)?;

    let (result, json) = match cli.command {
        Commands::Exec { run, argv } => {
            let json = run.json;
            (execute(CommandLine::Argv(argv), run).await?, json)
        }
        Commands::Sh { run, command } => {
            let json = run.json;
            (execute(CommandLine::Shell(command), run).await?, json)
        }
        Commands::Template {
            config,
            timeout,
            env,
            json,
            debug,
            sub_args,
        } => {
            let input = fs::read_to_string(&config)
                .with_context(|| format!("Failed to read template {}", config.display()))?;
            let mut template = CommandTemplate::from_toml(&input)?;
            if debug {
                template = template.with_debug_log(DebugLog::tracing());
            }

            let overrides = RunOverrides {
                timeout: timeout.as_deref().map(parse_timeout_spec).transpose()?,
                environment: env.into_iter().collect(),
            };
            let sub_args: Vec<SubArg> = sub_args.into_iter().map(SubArg::Text).collect();
            (template.run(sub_args, overrides).await?, json)
        }
    };

    if json {
        print_summary(&result)?;
    } else {
        print_output(&result)?;
    }

    process::exit(exit_code(result.status));
}

fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env();
    if debug {
        filter = filter.add_directive("cmdrun::debug_log=debug".parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn execute(command: CommandLine, run: RunArgs) -> anyhow::Result<CommandResult> {
    let mut options = RunOptions::default();
    if run.split_stderr {
        options = options.split_stderr();
    }
    if run.discard_stderr {
        options = options.discard_stderr();
    }
    if let Some(dir) = run.directory {
        options = options.with_working_directory(dir);
    }

    let environment: Environment = run.env.into_iter().collect();
    let mut supervisor = ProcessSupervisor::new()
        .with_timeout(run.timeout.as_deref().map(parse_timeout_spec).transpose()?)
        .with_environment(environment)
        .with_options(options);
    if run.debug {
        supervisor = supervisor.with_debug_log(DebugLog::tracing());
    }

    Ok(supervisor.run(command).await?)
}

fn print_output(result: &CommandResult) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&result.output)?;
    stdout.flush()?;

    if let Some(stderr) = &result.stderr {
        let mut err = std::io::stderr().lock();
        err.write_all(stderr)?;
        err.flush()?;
    }
    Ok(())
}

fn print_summary(result: &CommandResult) -> anyhow::Result<()> {
    let summary = json!({
        "pid": result.pid,
        "exit_code": result.status.code(),
        "signal": result.status.signal(),
        "output": result.output_lossy(),
        "stderr": result.stderr_lossy(),
        "started_at": result.started_at,
        "completed_at": result.completed_at,
        "duration_ms": result.duration_ms,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Shell convention: 128 + signal for a killed child
fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code,
        ExitStatus::Signaled(signal) => 128 + signal,
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("Empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
