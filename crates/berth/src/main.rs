use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use berth_fetch::{ArchiveFetchError, GitFetchError};
use berth_install::{
    load_runner, materialize, prepare_env, EnvPrepareError, EnvPrepareOptions, EnvReport,
    InstallPlan, MaterializeError, MaterializeOptions, RunnerResolveError, StepError,
};
use berth_runtime::{
    DoctorReport, LockInfo, RuntimeHome, Supervisor, SupervisorError,
};

const INSTALL_SCHEMA_VERSION: &str = "berth.install.report@0.1.0";
const START_SCHEMA_VERSION: &str = "berth.start.report@0.1.0";
const STOP_SCHEMA_VERSION: &str = "berth.stop.report@0.1.0";
const STATUS_SCHEMA_VERSION: &str = "berth.status.report@0.1.0";
const DOCTOR_SCHEMA_VERSION: &str = "berth.doctor.report@0.1.0";
const LOGS_SCHEMA_VERSION: &str = "berth.logs.report@0.1.0";

#[derive(Debug, Parser)]
#[command(name = "berth")]
#[command(about = "Materialize install plans and supervise the resulting processes.", long_about = None)]
struct Cli {
    /// Base directory for state and logs (default: $BERTH_HOME or ~/.berth).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Install(InstallArgs),
    Start(StartArgs),
    Stop(StopArgs),
    Status,
    Doctor { alias: String },
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// Install plan JSON produced by the catalog.
    #[arg(long)]
    plan: PathBuf,

    #[arg(long)]
    target: PathBuf,

    /// Skip runtime environment preparation after materializing.
    #[arg(long)]
    no_prepare: bool,
}

#[derive(Debug, Args)]
struct StartArgs {
    target: PathBuf,

    #[arg(long)]
    alias: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Args)]
struct StopArgs {
    alias: String,

    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

#[derive(Debug, Args)]
struct LogsArgs {
    alias: String,

    #[arg(short = 'n', long, default_value_t = 20)]
    lines: usize,
}

#[derive(Debug)]
struct Reporter {
    json: bool,
    quiet: bool,
    verbose: bool,
}

impl Reporter {
    fn progress(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        eprintln!("{msg}");
    }

    fn debug(&self, msg: &str) {
        if self.verbose && !self.json && !self.quiet {
            eprintln!("{msg}");
        }
    }
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let home = match cli.root {
        Some(root) => RuntimeHome::at(root),
        None => RuntimeHome::from_env()?,
    };
    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
        verbose: debug_enabled(),
    };

    match cli.cmd {
        Command::Install(args) => cmd_install(args, &reporter),
        Command::Start(args) => cmd_start(&home, args, &reporter),
        Command::Stop(args) => cmd_stop(&home, args, &reporter),
        Command::Status => cmd_status(&home, &reporter),
        Command::Doctor { alias } => cmd_doctor(&home, &alias, &reporter),
        Command::Logs(args) => cmd_logs(&home, args, &reporter),
    }
}

fn debug_enabled() -> bool {
    std::env::var("BERTH_DEBUG")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[derive(Debug, Serialize)]
struct ErrorReport {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

#[derive(Debug, Serialize)]
struct InstallReport {
    schema_version: &'static str,
    ok: bool,
    target: String,
    files_written: usize,
    artifacts_fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    runner_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<EnvReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

fn cmd_install(args: InstallArgs, reporter: &Reporter) -> Result<std::process::ExitCode> {
    let bytes = std::fs::read(&args.plan)
        .with_context(|| format!("read plan {}", args.plan.display()))?;
    let plan: InstallPlan = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse plan {}", args.plan.display()))?;
    let opts = MaterializeOptions::from_env();

    reporter.progress(&format!("materialize into {}", args.target.display()));
    reporter.debug(&format!(
        "plan: {} file(s), {} artifact(s)",
        plan.files.len(),
        plan.artifacts.len()
    ));

    let target = args.target.display().to_string();
    let (report, failed_step) = match materialize(&plan, &args.target, &opts) {
        Ok(report) => (report, None),
        Err(MaterializeError { report, step }) => (report, Some(step)),
    };

    if let Some(step) = failed_step {
        return emit_install(
            reporter,
            InstallReport {
                schema_version: INSTALL_SCHEMA_VERSION,
                ok: false,
                target,
                files_written: report.files_written,
                artifacts_fetched: report.artifacts_fetched,
                runner_path: report.runner_path.map(|p| p.display().to_string()),
                warnings: report.warnings,
                env: None,
                error: Some(ErrorReport {
                    code: step_error_code(&step).to_string(),
                    message: step.to_string(),
                    hint: None,
                }),
            },
        );
    }

    reporter.progress(&format!(
        "materialized: files={} artifacts={}",
        report.files_written, report.artifacts_fetched
    ));

    let mut env = None;
    if !args.no_prepare {
        let runner_path = report
            .runner_path
            .clone()
            .context("materialize finished without a runner path")?;
        let descriptor = load_runner(&runner_path)?;
        reporter.progress(&format!("prepare {} environment", descriptor.kind.as_str()));
        match prepare_env(&args.target, &descriptor, &EnvPrepareOptions::from_env()) {
            Ok(env_report) => env = Some(env_report),
            Err(err) => {
                return emit_install(
                    reporter,
                    InstallReport {
                        schema_version: INSTALL_SCHEMA_VERSION,
                        ok: false,
                        target,
                        files_written: report.files_written,
                        artifacts_fetched: report.artifacts_fetched,
                        runner_path: report.runner_path.map(|p| p.display().to_string()),
                        warnings: report.warnings,
                        env: None,
                        error: Some(ErrorReport {
                            code: env_error_code(&err).to_string(),
                            message: err.to_string(),
                            hint: None,
                        }),
                    },
                );
            }
        }
    }

    emit_install(
        reporter,
        InstallReport {
            schema_version: INSTALL_SCHEMA_VERSION,
            ok: true,
            target,
            files_written: report.files_written,
            artifacts_fetched: report.artifacts_fetched,
            runner_path: report.runner_path.map(|p| p.display().to_string()),
            warnings: report.warnings,
            env,
            error: None,
        },
    )
}

fn emit_install(reporter: &Reporter, report: InstallReport) -> Result<std::process::ExitCode> {
    if reporter.json {
        write_json_stdout(&report)?;
    } else if report.ok {
        println!("ok: installed into {}", report.target);
        for warning in &report.warnings {
            println!("warning: {warning}");
        }
    } else if let Some(err) = &report.error {
        println!("error: {}: {}", err.code, err.message);
        if let Some(hint) = &err.hint {
            println!("hint: {hint}");
        }
    }
    Ok(exit_for(report.ok))
}

fn cmd_start(
    home: &RuntimeHome,
    args: StartArgs,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    #[derive(Debug, Serialize)]
    struct StartReport {
        schema_version: &'static str,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        process: Option<LockInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorReport>,
    }

    let supervisor = Supervisor::new(home.clone())?;
    match supervisor.start(&args.target, args.alias.as_deref(), args.port) {
        Ok(info) => {
            reporter.progress(&format!(
                "logs: {}",
                supervisor.log_path(&info.alias).display()
            ));
            if reporter.json {
                write_json_stdout(&StartReport {
                    schema_version: START_SCHEMA_VERSION,
                    ok: true,
                    process: Some(info),
                    error: None,
                })?;
            } else {
                let port = info
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("ok: started {} (pid {}, port {port})", info.alias, info.pid);
            }
            Ok(exit_for(true))
        }
        Err(err) => {
            let code = supervisor_error_code(&err);
            if reporter.json {
                write_json_stdout(&StartReport {
                    schema_version: START_SCHEMA_VERSION,
                    ok: false,
                    process: None,
                    error: Some(ErrorReport {
                        code: code.to_string(),
                        message: err.to_string(),
                        hint: None,
                    }),
                })?;
            } else {
                println!("error: {code}: {err}");
            }
            Ok(exit_for(false))
        }
    }
}

fn cmd_stop(
    home: &RuntimeHome,
    args: StopArgs,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    #[derive(Debug, Serialize)]
    struct StopReport {
        schema_version: &'static str,
        ok: bool,
        alias: String,
        stopped: bool,
    }

    let supervisor = Supervisor::new(home.clone())?;
    let stopped = supervisor.stop(&args.alias, Duration::from_secs(args.grace_secs))?;

    if reporter.json {
        write_json_stdout(&StopReport {
            schema_version: STOP_SCHEMA_VERSION,
            ok: true,
            alias: args.alias.clone(),
            stopped,
        })?;
    } else if stopped {
        println!("ok: stopped {}", args.alias);
    } else {
        println!("ok: {} was not running", args.alias);
    }
    Ok(exit_for(true))
}

fn cmd_status(home: &RuntimeHome, reporter: &Reporter) -> Result<std::process::ExitCode> {
    #[derive(Debug, Serialize)]
    struct StatusReport {
        schema_version: &'static str,
        ok: bool,
        processes: Vec<LockInfo>,
    }

    let supervisor = Supervisor::new(home.clone())?;
    let processes = supervisor.status()?;

    if reporter.json {
        write_json_stdout(&StatusReport {
            schema_version: STATUS_SCHEMA_VERSION,
            ok: true,
            processes,
        })?;
    } else if processes.is_empty() {
        println!("no running processes");
    } else {
        for info in &processes {
            let port = info
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}  pid={}  port={port}  {}",
                info.alias,
                info.pid,
                info.target.display()
            );
        }
    }
    Ok(exit_for(true))
}

fn cmd_doctor(
    home: &RuntimeHome,
    alias: &str,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    #[derive(Debug, Serialize)]
    struct DoctorCliReport {
        schema_version: &'static str,
        alias: String,
        #[serde(flatten)]
        report: DoctorReport,
    }

    let supervisor = Supervisor::new(home.clone())?;
    let report = supervisor.doctor(alias)?;
    let ok = report.is_ok();

    if reporter.json {
        write_json_stdout(&DoctorCliReport {
            schema_version: DOCTOR_SCHEMA_VERSION,
            alias: alias.to_string(),
            report,
        })?;
    } else if ok {
        println!("ok: {}", report.reason);
    } else {
        println!("fail: {}", report.reason);
    }
    Ok(exit_for(ok))
}

fn cmd_logs(
    home: &RuntimeHome,
    args: LogsArgs,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    #[derive(Debug, Serialize)]
    struct LogsReport {
        schema_version: &'static str,
        ok: bool,
        alias: String,
        lines: Vec<String>,
    }

    let supervisor = Supervisor::new(home.clone())?;
    let lines = supervisor.tail_logs(&args.alias, args.lines)?;

    if reporter.json {
        write_json_stdout(&LogsReport {
            schema_version: LOGS_SCHEMA_VERSION,
            ok: true,
            alias: args.alias.clone(),
            lines,
        })?;
    } else {
        for line in &lines {
            println!("{line}");
        }
    }
    Ok(exit_for(true))
}

fn exit_for(ok: bool) -> std::process::ExitCode {
    if ok {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::from(1)
    }
}

fn write_json_stdout<T: Serialize>(v: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(v)?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .context("write stdout")?;
    Ok(())
}

fn step_error_code(step: &StepError) -> &'static str {
    match step {
        StepError::UnsafeFilePath { .. } => "FILE_PATH_UNSAFE",
        StepError::BadContent { .. } => "FILE_CONTENT_INVALID",
        StepError::FileWrite { .. } => "FILE_WRITE_FAILED",
        StepError::Archive(err) => match err {
            ArchiveFetchError::Http { .. } => "ARCHIVE_DOWNLOAD_FAILED",
            ArchiveFetchError::Status { .. } => "ARCHIVE_HTTP_STATUS",
            ArchiveFetchError::Integrity { .. } => "ARCHIVE_SHA256_MISMATCH",
            ArchiveFetchError::UnsafePath { .. } => "ARCHIVE_UNSAFE_PATH",
            ArchiveFetchError::UnknownFormat { .. } => "ARCHIVE_UNKNOWN_FORMAT",
            ArchiveFetchError::Io { .. } => "ARCHIVE_IO",
        },
        StepError::Git(err) => match err {
            GitFetchError::InvalidRepoUrl { .. } => "GIT_BAD_URL",
            GitFetchError::InsecureScheme { .. } => "GIT_INSECURE_SCHEME",
            GitFetchError::DisallowedHost { .. } => "GIT_HOST_NOT_ALLOWED",
            GitFetchError::InvalidRef { .. } => "GIT_BAD_REF",
            GitFetchError::InvalidSubdir { .. } => "GIT_BAD_SUBDIR",
            GitFetchError::GitMissing { .. } => "GIT_NOT_FOUND",
            GitFetchError::Process { .. } => "GIT_FAILED",
            GitFetchError::Timeout { .. } => "GIT_TIMEOUT",
            GitFetchError::SubdirMissing { .. } => "GIT_SUBDIR_MISSING",
            GitFetchError::VerifyMismatch { .. } => "GIT_VERIFY_MISMATCH",
            GitFetchError::Io { .. } => "GIT_IO",
        },
        StepError::Runner(err) => match err {
            RunnerResolveError::Unresolvable { .. } => "RUNNER_UNRESOLVED",
            RunnerResolveError::Invalid { .. } => "RUNNER_INVALID",
            RunnerResolveError::Io { .. } => "RUNNER_IO",
        },
        StepError::Io { .. } => "IO",
    }
}

fn env_error_code(err: &EnvPrepareError) -> &'static str {
    match err {
        EnvPrepareError::ToolMissing { .. } => "ENV_TOOL_MISSING",
        EnvPrepareError::Install { .. } => "ENV_INSTALL_FAILED",
        EnvPrepareError::Timeout { .. } => "ENV_TIMEOUT",
        EnvPrepareError::Io { .. } => "ENV_IO",
    }
}

fn supervisor_error_code(err: &SupervisorError) -> &'static str {
    match err {
        SupervisorError::InvalidAlias { .. } => "INVALID_ALIAS",
        SupervisorError::AlreadyRunning { .. } => "ALREADY_RUNNING",
        SupervisorError::RunnerMissing { .. } => "RUNNER_MISSING",
        SupervisorError::RunnerInvalid { .. } => "RUNNER_INVALID",
        SupervisorError::EnvNotPrepared { .. } => "ENV_NOT_PREPARED",
        SupervisorError::Spawn { .. } => "SPAWN_FAILED",
        SupervisorError::PortExhausted { .. } => "PORT_EXHAUSTED",
        SupervisorError::Io { .. } => "IO",
    }
}
