//! RuleFlow CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Build the default targets of rules.yaml on 8 cores
//! ruleflow --cores 8
//!
//! # Build specific targets from another rule file
//! ruleflow --rules pipeline.yaml --cores all results/a.txt results/b.txt
//!
//! # Preview the jobs that would run
//! ruleflow --dry-run
//!
//! # Export the rule graph for Graphviz
//! ruleflow --export-dag rulegraph | dot -Tsvg > rules.svg
//! ```
//!
//! # Exit Codes
//!
//! - 0: success
//! - 1: completed with failures
//! - 2: configuration or graph error
//! - 3: nothing to do

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use ruleflow::dag::{export, ExportFormat};
use ruleflow::execution::Engine;
use ruleflow::monitoring::HostCapacity;
use ruleflow::settings::{Freshness, Settings};
use ruleflow::workflow::parser::load_workflow;
use ruleflow::{APP_NAME, VERSION};

/// Default rule file used when none is specified.
const DEFAULT_RULES: &str = "rules.yaml";

/// Exit code for configuration and graph errors.
const EXIT_FATAL: u8 = 2;

/// What the invocation asks for besides a normal run.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Run,
    ExportDag(ExportFormat),
    ListRules,
    ListResources,
    Summary,
    DeleteOutput,
    CleanupMetadata,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    rules_path: String,
    config_path: Option<PathBuf>,
    targets: Vec<String>,
    cores: Option<String>,
    jobs: Option<usize>,
    resources: Vec<String>,
    executor: Option<String>,
    retries: Option<u32>,
    halt_on_failure: bool,
    force: bool,
    forceall: bool,
    checksum: bool,
    working_dir: Option<PathBuf>,
    pause_flag: Option<PathBuf>,
    action: Action,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_path: DEFAULT_RULES.to_string(),
            config_path: None,
            targets: Vec::new(),
            cores: None,
            jobs: None,
            resources: Vec::new(),
            executor: None,
            retries: None,
            halt_on_failure: false,
            force: false,
            forceall: false,
            checksum: false,
            working_dir: None,
            pause_flag: None,
            action: Action::Run,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    eprintln!();
    eprintln!("{} v{}", APP_NAME.bold(), VERSION);
    eprintln!("Rule-Based Workflow Engine");
    eprintln!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: ruleflow [OPTIONS] [TARGETS...]");
    println!();
    println!("Arguments:");
    println!("  [TARGETS...]              Output paths or rule names to build (default: rule file targets)");
    println!();
    println!("Options:");
    println!("  --rules FILE              Rule file (default: {})", DEFAULT_RULES);
    println!("  --config FILE             YAML settings file");
    println!("  --cores N|all             Cores available to jobs");
    println!("  --jobs N                  Maximum concurrently running jobs");
    println!("  --resource NAME=AMOUNT    Capacity of a resource (repeatable)");
    println!("  --executor NAME           Executor backend (local, dryrun, touch)");
    println!("  --dry-run                 Preview jobs without execution");
    println!("  --touch                   Mark outputs as up to date without running commands");
    println!("  --retries N               Extra attempts for failing jobs");
    println!("  --halt-on-failure         Stop everything after the first permanent failure");
    println!("  --force                   Rerun the jobs producing the given targets");
    println!("  --forceall                Rerun every job");
    println!("  --checksum                Compare input content instead of modification times");
    println!("  --working-dir PATH        Directory relative paths are resolved against");
    println!("  --pause-flag PATH         Suspend dispatch while this file exists");
    println!("  --export-dag FORMAT       Print the job graph (json, dot, rulegraph, filegraph)");
    println!("  --list-rules              List all rules");
    println!("  --list-resources          List all declared resources");
    println!("  --summary                 Show the status of every output");
    println!("  --delete-output           Delete all outputs of the requested targets");
    println!("  --cleanup-metadata        Remove saved run state");
    println!("  --verbose                 Enable debug logging");
    println!("  --help                    Show this help message");
    println!("  --version                 Show version information");
    println!();
    println!("Examples:");
    println!("  ruleflow --cores 8");
    println!("  ruleflow --rules pipeline.yaml --cores all --retries 2 results/summary.txt");
    println!("  ruleflow --dry-run --forceall");
}

/// Returns the value following option `args[*i]`.
fn option_value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let option = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--rules" | "-s" => config.rules_path = option_value(args, &mut i)?.to_string(),
            "--config" => config.config_path = Some(PathBuf::from(option_value(args, &mut i)?)),
            "--cores" | "-c" => config.cores = Some(option_value(args, &mut i)?.to_string()),
            "--jobs" | "-j" => {
                let value = option_value(args, &mut i)?;
                config.jobs = Some(value.parse().map_err(|_| format!("Invalid jobs value: {}", value))?);
            }
            "--resource" => config.resources.push(option_value(args, &mut i)?.to_string()),
            "--executor" => config.executor = Some(option_value(args, &mut i)?.to_string()),
            "--dry-run" | "-n" => config.executor = Some("dryrun".to_string()),
            "--touch" | "-t" => config.executor = Some("touch".to_string()),
            "--retries" => {
                let value = option_value(args, &mut i)?;
                config.retries = Some(value.parse().map_err(|_| format!("Invalid retries value: {}", value))?);
            }
            "--halt-on-failure" => config.halt_on_failure = true,
            "--force" | "-f" => config.force = true,
            "--forceall" | "-F" => config.forceall = true,
            "--checksum" => config.checksum = true,
            "--working-dir" | "-d" => config.working_dir = Some(PathBuf::from(option_value(args, &mut i)?)),
            "--pause-flag" => config.pause_flag = Some(PathBuf::from(option_value(args, &mut i)?)),
            "--export-dag" => {
                let value = option_value(args, &mut i)?;
                let format = ExportFormat::parse(value).ok_or_else(|| format!("Unknown export format: {}", value))?;
                config.action = Action::ExportDag(format);
            }
            "--list-rules" => config.action = Action::ListRules,
            "--list-resources" => config.action = Action::ListResources,
            "--summary" => config.action = Action::Summary,
            "--delete-output" => config.action = Action::DeleteOutput,
            "--cleanup-metadata" => config.action = Action::CleanupMetadata,
            "--verbose" | "-v" => config.verbose = true,
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => config.targets.push(arg.clone()),
        }
        i += 1;
    }

    Ok(config)
}

/// Layers command line flags over the settings file and defaults.
fn build_settings(config: &Config) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = match &config.config_path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    if let Some(cores) = &config.cores {
        settings.resources.cores = Some(Settings::parse_cores(cores, HostCapacity::detect().cores)?);
    }
    if let Some(jobs) = config.jobs {
        settings.resources.max_jobs = Some(jobs);
    }
    for resource in &config.resources {
        let (name, amount) = Settings::parse_limit(resource)?;
        settings.resources.limits.insert(name, amount);
    }
    if let Some(executor) = &config.executor {
        settings.executor = executor.clone();
    }
    if let Some(retries) = config.retries {
        settings.execution.retries = retries;
    }
    if config.halt_on_failure {
        settings.execution.halt_on_failure = true;
    }
    if config.force {
        settings.execution.force_targets.extend(config.targets.iter().cloned());
    }
    if config.forceall {
        settings.execution.force_all = true;
    }
    if config.checksum {
        settings.execution.freshness = Freshness::Checksum;
    }
    if let Some(dir) = &config.working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
        settings.execution.working_dir = Some(dir.clone());
    }
    if let Some(flag) = &config.pause_flag {
        settings.execution.pause_flag = Some(flag.clone());
    }

    Ok(settings)
}

/// Performs the requested action and returns the process exit code.
fn run(config: Config) -> Result<u8, Box<dyn std::error::Error>> {
    let settings = build_settings(&config)?;

    if let Some(ref path) = settings.execution.pause_flag {
        info!("Pause control: {}", path.display());
    }
    if settings.executor == "dryrun" {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    // Load rules
    info!("Loading rules: {}", config.rules_path);
    let workflow = load_workflow(&config.rules_path).map_err(|e| {
        error!("Failed to load rules: {}", e);
        format!("Could not load rules from '{}': {}", config.rules_path, e)
    })?;
    info!("Rules loaded: {} rules", workflow.len());

    // Create and configure engine
    let mut engine = Engine::new(workflow);
    engine.set_workflow_path(&config.rules_path);
    engine.set_settings(settings);

    match config.action {
        Action::Run => {
            let report = engine.run(&config.targets)?;
            Ok(report.status.exit_code() as u8)
        }
        Action::ExportDag(format) => {
            let graph = engine.build_graph(&config.targets)?;
            println!("{}", export(&graph, format)?);
            Ok(0)
        }
        Action::ListRules => {
            for rule in engine.list_rules() {
                println!("{}", rule);
            }
            Ok(0)
        }
        Action::ListResources => {
            for resource in engine.list_resources() {
                println!("{}", resource);
            }
            Ok(0)
        }
        Action::Summary => {
            println!("output_file\trule\tstatus\tplan");
            for row in engine.summary(&config.targets)? {
                let status = if row.exists { "ok" } else { "missing" };
                let plan = row.reason.unwrap_or_else(|| "no update".to_string());
                println!("{}\t{}\t{}\t{}", row.path, row.rule, status, plan);
            }
            Ok(0)
        }
        Action::DeleteOutput => {
            let dry_run = engine.settings().executor == "dryrun";
            let deleted = engine.delete_output(&config.targets, dry_run)?;
            info!("{} output(s) {}", deleted.len(), if dry_run { "would be deleted" } else { "deleted" });
            Ok(0)
        }
        Action::CleanupMetadata => {
            engine.cleanup_metadata()?;
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = match parse_arguments(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::from(EXIT_FATAL);
        }
    };

    setup_logging(config.verbose);
    print_banner();

    match run(config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("ruleflow").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert_eq!(config.rules_path, DEFAULT_RULES);
        assert_eq!(config.action, Action::Run);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_parse_run_options() {
        let config = parse_arguments(&args(&[
            "--cores", "4", "--jobs", "2", "--resource", "mem_mb=1000", "--dry-run", "--retries", "3", "a.txt",
            "b.txt",
        ]))
        .unwrap();
        assert_eq!(config.cores.as_deref(), Some("4"));
        assert_eq!(config.jobs, Some(2));
        assert_eq!(config.executor.as_deref(), Some("dryrun"));
        assert_eq!(config.targets, vec!["a.txt", "b.txt"]);

        let settings = build_settings(&config).unwrap();
        assert_eq!(settings.resources.cores, Some(4));
        assert_eq!(settings.resources.limits.get("mem_mb"), Some(&1000));
        assert_eq!(settings.execution.retries, 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--cores"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["--export-dag", "png"])).is_err());
        assert!(parse_arguments(&args(&["--jobs", "many"])).is_err());
    }

    #[test]
    fn test_force_applies_to_targets() {
        let config = parse_arguments(&args(&["--force", "out.txt"])).unwrap();
        let settings = build_settings(&config).unwrap();
        assert_eq!(settings.execution.force_targets, vec!["out.txt"]);
    }

    #[test]
    fn test_export_action() {
        let config = parse_arguments(&args(&["--export-dag", "rulegraph"])).unwrap();
        assert_eq!(config.action, Action::ExportDag(ExportFormat::RuleGraph));
    }
}
