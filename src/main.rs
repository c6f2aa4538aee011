use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use procpipe::config::Settings;
use procpipe::subprocess::{
    run_command, split_command_line, Environment, Process, ProcessCommandBuilder, ProcessConfig,
    ProcessError, RunOptions, SubprocessManager,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Exit code reported when `exec --timeout` expires, as timeout(1) does.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Run child processes with piped standard streams
#[derive(Parser)]
#[command(name = "procpipe", version)]
#[command(about = "Run child processes with piped stdio and report how they exit", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to settings file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program, printing its output prefixed with out:/err:
    Run {
        /// Start in a new session with all streams on the null device and return
        #[arg(long)]
        detach: bool,

        /// Working directory for the program
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Set an environment variable (KEY=VALUE); repeatable. An explicit
        /// environment disables the PATH search, so give the program as a path
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Start from an empty environment instead of inheriting ours
        #[arg(long)]
        clear_env: bool,

        /// Text written to the program's stdin before it is closed
        #[arg(long)]
        input: Option<String>,

        /// Program to run
        program: String,

        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a whitespace-separated command line once
    Exec {
        /// Collect stdout and stderr and print them when the command finishes
        #[arg(long)]
        capture: bool,

        /// Print captured lines as they arrive
        #[arg(long)]
        echo: bool,

        /// Start in a new session and return without waiting
        #[arg(long)]
        detach: bool,

        /// Kill the command after this many seconds. Output is collected and
        /// printed when the command finishes
        #[arg(long, value_name = "SECS", conflicts_with_all = ["detach", "echo"])]
        timeout: Option<u64>,

        /// Command line, e.g. "ls -l /tmp"
        command_line: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2) // Show target module for -vv and above
        .with_thread_ids(cli.verbose >= 3) // Show thread IDs for -vvv
        .with_line_number(cli.verbose >= 3) // Show line numbers for -vvv
        .init();

    debug!("procpipe started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match Settings::load(cli.config.as_deref()).context("Failed to load settings") {
        Ok(settings) => dispatch(cli.command, settings).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch(command: Commands, settings: Settings) -> anyhow::Result<i32> {
    match command {
        Commands::Run {
            detach,
            cwd,
            env,
            clear_env,
            input,
            program,
            args,
        } => {
            let mut builder = ProcessCommandBuilder::new(&program)
                .args(args)
                .detached(detach);
            if let Some(dir) = cwd {
                builder = builder.current_dir(&dir);
            }
            let mut config = builder.build_config();

            if clear_env {
                config.env = Environment::Replace(Vec::new());
            } else if !env.is_empty() {
                config.env = Environment::from_current();
            }
            for entry in &env {
                let Some((key, value)) = entry.split_once('=') else {
                    bail!("Invalid --env value {:?}, expected KEY=VALUE", entry);
                };
                config.env.set(key, value);
            }

            tokio::task::spawn_blocking(move || run_process(config, input, settings))
                .await
                .context("Process task failed")?
        }
        Commands::Exec {
            capture,
            echo,
            detach,
            timeout,
            command_line,
        } => match timeout {
            Some(secs) => exec_with_timeout(&command_line, Duration::from_secs(secs), settings).await,
            None => {
                let options = RunOptions::default()
                    .capture(capture)
                    .echo(echo)
                    .detach(detach)
                    .settings(settings);
                tokio::task::spawn_blocking(move || exec_once(&command_line, options, echo))
                    .await
                    .context("Command task failed")?
            }
        },
    }
}

fn print_prefixed(prefix: &str, line: &str) {
    let line = line.strip_suffix('\n').unwrap_or(line);
    println!("{prefix}: {line}");
}

fn run_process(
    config: ProcessConfig,
    input: Option<String>,
    settings: Settings,
) -> anyhow::Result<i32> {
    let command = config.display_command();
    let mut process = Process::with_settings(config, settings);
    process
        .on_output_line(|line| print_prefixed("out", line))
        .on_error_line(|line| print_prefixed("err", line));
    process
        .start()
        .with_context(|| format!("Failed to start {}", command))?;

    if process.is_detached() {
        if let Some(pid) = process.pid() {
            println!("detached: pid {}", pid);
        }
        return Ok(0);
    }

    if let Some(input) = input {
        if let Err(e) = process.write_stdin(input.as_bytes()) {
            debug!("Child stopped reading stdin: {}", e);
        }
    }

    let code = process
        .wait_for_exit()
        .with_context(|| format!("Failed to wait for {}", command))?;
    // Join the output threads before the caller exits the process.
    drop(process);
    Ok(code)
}

fn exec_once(command_line: &str, options: RunOptions, echoed: bool) -> anyhow::Result<i32> {
    let capture = options.capture;
    let outcome = run_command(command_line, options)
        .with_context(|| format!("Failed to run {:?}", command_line))?;

    if capture && !echoed {
        print!("{}", outcome.output);
    }
    match outcome.status {
        Some(status) => Ok(status.code().unwrap_or(1)),
        None => Ok(0),
    }
}

async fn exec_with_timeout(
    command_line: &str,
    timeout: Duration,
    settings: Settings,
) -> anyhow::Result<i32> {
    let words = split_command_line(command_line);
    let Some((program, args)) = words.split_first() else {
        bail!("Empty command line");
    };

    let command = ProcessCommandBuilder::new(program)
        .args(args)
        .timeout(timeout)
        .build();
    let runner = SubprocessManager::with_settings(settings).runner();

    match runner.run(command).await {
        Ok(output) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(output.status.code().unwrap_or(1))
        }
        Err(ProcessError::Timeout(limit)) => {
            eprintln!("Command timed out after {:?}: {}", limit, command_line);
            Ok(TIMEOUT_EXIT_CODE)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to run {:?}", command_line)),
    }
}
