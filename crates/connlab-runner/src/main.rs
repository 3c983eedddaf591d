use clap::{parser::ValueSource, CommandFactory, FromArgMatches, Parser};
use connlab_core::error::HarnessError;
use connlab_harness::scenarios::{self, Scenario};
use connlab_harness::HarnessConfig;
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "connlab",
    about = "connlab - deterministic HTTP/1.1 connection scenarios"
)]
struct Args {
    /// Scenario to run; repeat to run several. Runs the whole catalogue when omitted.
    #[arg(long = "scenario", short = 's', value_name = "NAME")]
    scenarios: Vec<String>,
    #[arg(long = "list")]
    list: bool,
    #[arg(long = "connection-limit", value_parser = parse_connection_limit)]
    connection_limit: Option<usize>,
    #[arg(long = "idle-timeout-ms", value_name = "MS")]
    idle_timeout_ms: Option<u64>,
    #[arg(long = "admission-timeout-ms", value_name = "MS", default_value_t = 10_000)]
    admission_timeout_ms: u64,
    #[arg(long = "max-hops", default_value_t = 8)]
    max_hops: usize,
    #[arg(long = "debug-io")]
    debug_io: bool,
    /// Keep going after the first failing scenario.
    #[arg(long = "keep-going")]
    keep_going: bool,
}

fn main() {
    init_logging();
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());

    if args.list {
        for scenario in scenarios::catalogue() {
            println!("{:<32} {}", scenario.name, scenario.description);
        }
        return;
    }

    let selected = select_scenarios(&args.scenarios).unwrap_or_else(|err| {
        tracing::error!("{}", err);
        std::process::exit(2);
    });
    let config = build_config(&args, &matches);

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|err| {
            tracing::error!("Failed to build Tokio runtime: {}", err);
            std::process::exit(1);
        });
    let failed = runtime.block_on(run_all(&selected, &config, args.keep_going));
    if failed > 0 {
        tracing::error!("{} of {} scenarios failed", failed, selected.len());
        std::process::exit(1);
    }
}

async fn run_all(selected: &[Scenario], config: &HarnessConfig, keep_going: bool) -> usize {
    let mut failed = 0;
    for scenario in selected {
        let started = Instant::now();
        match scenario.run(config.clone()).await {
            Ok(reports) => {
                println!(
                    "ok    {:<32} {:>4} ops {:>6} ms",
                    scenario.name,
                    reports.len(),
                    started.elapsed().as_millis()
                );
                for report in &reports {
                    tracing::debug!(
                        "op {} {:?}: state={:?} status={:?} error={} connections={:?} hops={}",
                        report.operation_id,
                        report.kind,
                        report.state,
                        report.status,
                        report.error,
                        report.connections,
                        report.hops
                    );
                }
            }
            Err(err) => {
                failed += 1;
                println!("FAIL  {:<32} {}", scenario.name, describe(&err));
                if !keep_going {
                    break;
                }
            }
        }
    }
    failed
}

fn describe(err: &HarnessError) -> String {
    match err {
        HarnessError::Assertion(message) => format!("assertion: {}", message),
        other => format!("{} ({})", other, other.kind()),
    }
}

fn select_scenarios(names: &[String]) -> Result<Vec<Scenario>, String> {
    if names.is_empty() {
        return Ok(scenarios::catalogue());
    }
    names
        .iter()
        .map(|name| scenarios::find(name).ok_or_else(|| format!("Unknown scenario: {}", name)))
        .collect()
}

/// CLI values win; anything not given on the command line keeps the
/// environment-derived default.
fn build_config(args: &Args, matches: &clap::ArgMatches) -> HarnessConfig {
    let mut config = HarnessConfig::default()
        .with_max_hops(args.max_hops)
        .with_debug_io(args.debug_io);
    if cli_provided(matches, "admission_timeout_ms") {
        config = config.with_admission_timeout(Duration::from_millis(args.admission_timeout_ms));
    }
    if let Some(limit) = args.connection_limit {
        config = config.with_connection_limit(Some(limit));
    }
    if let Some(idle_ms) = args.idle_timeout_ms {
        config = config.with_max_idle_time(Some(Duration::from_millis(idle_ms)));
    }
    config
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init();
}

fn parse_connection_limit(input: &str) -> Result<usize, String> {
    let trimmed = input.trim();
    let value = trimmed
        .parse::<usize>()
        .map_err(|_| format!("Invalid connection-limit value: {}", trimmed))?;
    if value == 0 {
        return Err("connection-limit must be at least 1".to_string());
    }
    Ok(value)
}

fn cli_provided(matches: &clap::ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> (Args, clap::ArgMatches) {
        let matches = Args::command()
            .try_get_matches_from(argv)
            .expect("arguments parse");
        let args = Args::from_arg_matches(&matches).expect("args build");
        (args, matches)
    }

    #[test]
    fn defaults_keep_environment_admission_timeout() {
        let (args, matches) = parse(&["connlab"]);
        let config = build_config(&args, &matches);
        assert_eq!(
            config.admission_timeout,
            HarnessConfig::default().admission_timeout
        );
        assert_eq!(config.default_connection_limit, None);
    }

    #[test]
    fn command_line_overrides_apply() {
        let (args, matches) = parse(&[
            "connlab",
            "--admission-timeout-ms",
            "250",
            "--connection-limit",
            "3",
            "--idle-timeout-ms",
            "40",
            "--debug-io",
        ]);
        let config = build_config(&args, &matches);
        assert_eq!(config.admission_timeout, Duration::from_millis(250));
        assert_eq!(config.default_connection_limit, Some(3));
        assert_eq!(config.default_max_idle_time, Some(Duration::from_millis(40)));
        assert!(config.debug_io);
    }

    #[test]
    fn zero_connection_limit_is_rejected() {
        assert!(Args::command()
            .try_get_matches_from(["connlab", "--connection-limit", "0"])
            .is_err());
    }

    #[test]
    fn unknown_scenario_is_reported() {
        let err = select_scenarios(&["no-such-thing".to_string()]).unwrap_err();
        assert!(err.contains("no-such-thing"));
        assert_eq!(
            select_scenarios(&[]).map(|all| all.len()).ok(),
            Some(scenarios::catalogue().len())
        );
    }
}
