use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use skill_runner::{
    EgressMode, ExecutionConfig, RunnerConfig, SkillError, SkillInput, SkillOutput, SkillRunner,
};

const DEFAULT_CONFIG_PATH: &str = "skill-runner.toml";

fn print_help() {
    println!(
        "\
skill-runner v{}

Runs a skill once inside an isolated Docker sandbox and prints its result.

USAGE:
    skill-runner [OPTIONS] <SKILL_DIR> [INPUT]

ARGUMENTS:
    SKILL_DIR    Directory holding manifest.json and a Dockerfile
    INPUT        JSON object passed to the skill on stdin [default: {{}}]
                 Use @FILE to read it from a file, or - to read stdin

OPTIONS:
    -c, --config PATH      TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -t, --timeout SECS     Wall-clock limit for this run
        --no-egress        Deny all network egress, whatever the manifest declares
    -e, --env KEY=VALUE    Pass an environment variable to the skill (repeatable)
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.
    Variables a manifest declares are taken from the environment when not
    set with --env.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, skill_runner=debug,warn)

EXAMPLES:
    skill-runner demos/echo '{{\"msg\": \"hi\"}}'
    skill-runner --no-egress -t 10 demos/echo @input.json
    echo '{{}}' | RUST_LOG=debug skill-runner demos/echo -",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line.
#[derive(Debug, Default)]
struct Cli {
    config_path: Option<PathBuf>,
    timeout_secs: Option<u64>,
    no_egress: bool,
    env: Vec<(String, String)>,
    skill_dir: Option<PathBuf>,
    input: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "-c" | "--config" => cli.config_path = Some(PathBuf::from(value("--config")?)),
            "-t" | "--timeout" => {
                let raw = value("--timeout")?;
                let secs = raw
                    .parse()
                    .with_context(|| format!("invalid timeout '{raw}'"))?;
                cli.timeout_secs = Some(secs);
            }
            "--no-egress" => cli.no_egress = true,
            "-e" | "--env" => {
                let pair = value("--env")?;
                let (key, val) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--env expects KEY=VALUE, got '{pair}'"))?;
                cli.env.push((key.to_string(), val.to_string()));
            }
            "-" => positional(&mut cli, &arg)?,
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'"),
            other => positional(&mut cli, other)?,
        }
    }

    if cli.skill_dir.is_none() {
        bail!("missing SKILL_DIR (see --help)");
    }
    Ok(cli)
}

fn positional(cli: &mut Cli, arg: &str) -> Result<()> {
    if cli.skill_dir.is_none() {
        cli.skill_dir = Some(PathBuf::from(arg));
    } else if cli.input.is_none() {
        cli.input = Some(arg.to_string());
    } else {
        bail!("unexpected argument '{arg}'");
    }
    Ok(())
}

impl Cli {
    /// Call-scoped overrides from the command line.
    fn overrides(&self) -> ExecutionConfig {
        let mut config = ExecutionConfig {
            timeout_secs: self.timeout_secs,
            ..ExecutionConfig::default()
        };
        if self.no_egress {
            config = config.with_egress(EgressMode::None);
        }
        for (key, value) in &self.env {
            config = config.with_env(key, value);
        }
        config
    }
}

/// Loads the config file. A missing file is fine when the path was defaulted.
fn load_config(explicit: Option<&Path>) -> Result<RunnerConfig> {
    let path = explicit.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    if explicit.is_none() && !path.exists() {
        debug!("No {DEFAULT_CONFIG_PATH} found, using built-in defaults");
        return Ok(RunnerConfig::default());
    }
    info!("Loading configuration from {}", path.display());
    RunnerConfig::load(path).with_context(|| format!("cannot load {}", path.display()))
}

async fn read_input(raw: Option<&str>) -> Result<Map<String, Value>> {
    let text = match raw {
        None => return Ok(Map::new()),
        Some("-") => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
        Some(arg) => match arg.strip_prefix('@') {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read input file {path}"))?,
            None => arg.to_string(),
        },
    };

    match serde_json::from_str::<Value>(&text).context("input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("input must be a JSON object"),
    }
}

async fn run(cli: &Cli) -> std::result::Result<SkillOutput, SkillError> {
    let config = load_config(cli.config_path.as_deref())
        .map_err(|e| SkillError::config(format!("{e:#}")))?;
    let data = read_input(cli.input.as_deref())
        .await
        .map_err(|e| SkillError::config(format!("{e:#}")))?;
    let skill_dir = cli.skill_dir.clone().unwrap_or_default();

    let runner = SkillRunner::docker(config.execution);
    runner
        .execute(&SkillInput::new(skill_dir, data), Some(&cli.overrides()))
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("skill-runner v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr; stdout carries only the result document
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("skill_runner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => run(&cli).await,
        Err(e) => Err(SkillError::config(format!("{e:#}"))),
    };

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            let doc = json!({ "success": false, "error": e.to_json() });
            println!("{}", serde_json::to_string_pretty(&doc)?);
            std::process::exit(1);
        }
    }
}
