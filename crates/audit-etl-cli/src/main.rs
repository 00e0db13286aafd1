mod logging;

use anyhow::{Context, Result};
use audit_etl_core::artifact::read_artifact;
use audit_etl_core::config::{ConfigError, DEFAULT_CONFIG_FILE, DEFAULT_LOG_FILE};
use audit_etl_core::{EtlConfig, Pipeline, RunId, RunReport, TieBreak, Transformer};
use chrono::Local;
use clap::{Parser, Subcommand};
use logging::{init_logging, Console};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "audit-etl")]
#[command(about = "Incremental ETL of workflow audit records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one watermark-bounded extract, transform and load pass
    Run {
        #[arg(long, env = "AUDIT_ETL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        debug: bool,
    },
    /// Transform an existing artifact and print records as JSON lines
    Transform {
        artifact: PathBuf,
        #[arg(long, default_value = "first-seen")]
        tie_break: TieBreak,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, debug } => run(&config, debug),
        Commands::Transform {
            artifact,
            tie_break,
        } => {
            let _log_guard = init_logging(None, false, Console::Stderr);
            match transform(&artifact, tie_break) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!(event = "transform_failed", error = %format!("{err:#}"));
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run(config_path: &Path, debug: bool) -> ExitCode {
    let config = match EtlConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            let log_file = Path::new(DEFAULT_LOG_FILE);
            let _log_guard = init_logging(Some(log_file), debug, Console::Stderr);
            log_config_failure(config_path, &err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let _log_guard = init_logging(Some(&config.settings.log_file), debug, Console::Stdout);

    let run_id = RunId::new();
    info!(
        event = "etl_start",
        run_id = %run_id,
        config = %config_path.display(),
        source = %config.source.describe(),
        target = %config.target.describe()
    );
    match execute(&config, &run_id) {
        Ok(report) => {
            info!(
                event = "etl_done",
                run_id = %report.run_id,
                watermark = %report.watermark,
                records = report.transform.records,
                inserted = report.load.inserted,
                skipped = report.load.skipped,
                artifact = %report
                    .artifact
                    .as_deref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "removed".to_string())
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(
                event = "etl_failed",
                severity = "critical",
                run_id = %run_id,
                error = %format!("{err:#}")
            );
            ExitCode::FAILURE
        }
    }
}

fn log_config_failure(config_path: &Path, err: &ConfigError) {
    error!(
        event = "config_failed",
        severity = "critical",
        config = %config_path.display(),
        error = %err
    );
}

fn execute(config: &EtlConfig, run_id: &RunId) -> Result<RunReport> {
    let mut stores = audit_etl_storage::connect(config).context("connect to databases")?;
    let result = Pipeline::new(
        stores.source.as_mut(),
        stores.target.as_mut(),
        &config.settings,
    )
    .run(run_id, Local::now().date_naive());
    stores.close();

    result.map_err(|err| {
        let stage = err.stage();
        anyhow::Error::new(err).context(format!("{stage} stage failed"))
    })
}

fn transform(artifact: &Path, tie_break: TieBreak) -> Result<()> {
    let rows = read_artifact(artifact)
        .with_context(|| format!("read artifact {}", artifact.display()))?;
    let output = Transformer::new(tie_break).transform(&rows);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for record in &output.records {
        let line = serde_json::to_string(record).context("serialize record")?;
        writeln!(out, "{line}").context("write record")?;
    }
    out.flush().context("flush output")?;

    info!(
        event = "transform_done",
        rows = output.report.rows_read,
        records = output.report.records,
        with_doc_id = output.report.with_document_id,
        with_context = output.report.with_context_data,
        tie_break = %tie_break
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use logging::{build_subscriber, open_shared_log_file};
    use tempfile::tempdir;
    use tracing_subscriber::EnvFilter;

    #[test]
    fn run_defaults_to_the_standard_config_file() {
        let cli = Cli::try_parse_from(["audit-etl", "run"]).expect("parse");
        let Commands::Run { config, debug } = cli.command else {
            panic!("expected run");
        };
        if std::env::var_os("AUDIT_ETL_CONFIG").is_none() {
            assert_eq!(config, PathBuf::from("db_config.toml"));
        }
        assert!(!debug);
    }

    #[test]
    fn run_accepts_config_and_debug() {
        let cli = Cli::try_parse_from(["audit-etl", "run", "--config", "etc/etl.toml", "--debug"])
            .expect("parse");
        let Commands::Run { config, debug } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(config, PathBuf::from("etc/etl.toml"));
        assert!(debug);
    }

    #[test]
    fn transform_parses_tie_break_policy() {
        let cli = Cli::try_parse_from([
            "audit-etl",
            "transform",
            "output/data_2024-01-02_0a1b2c3d.csv",
            "--tie-break",
            "last-seen",
        ])
        .expect("parse");
        let Commands::Transform {
            artifact,
            tie_break,
        } = cli.command
        else {
            panic!("expected transform");
        };
        assert_eq!(artifact, PathBuf::from("output/data_2024-01-02_0a1b2c3d.csv"));
        assert_eq!(tie_break, TieBreak::LastSeen);
    }

    #[test]
    fn unknown_tie_break_is_rejected() {
        assert!(Cli::try_parse_from(["audit-etl", "transform", "a.csv", "--tie-break", "median"])
            .is_err());
    }

    #[test]
    fn config_failure_reaches_the_log_file() {
        let dir = tempdir().expect("tempdir");
        let log_path = dir.path().join("etl_process.log");
        let file = open_shared_log_file(&log_path).expect("open log file");
        let subscriber = build_subscriber(EnvFilter::new("info"), Console::Stderr, Some(file));

        let config_path = dir.path().join("absent.toml");
        let err = EtlConfig::load(&config_path).expect_err("config missing");
        tracing::subscriber::with_default(subscriber, || log_config_failure(&config_path, &err));

        let contents = std::fs::read_to_string(&log_path).expect("read log");
        let line = contents
            .lines()
            .find(|line| line.contains("config_failed"))
            .expect("config failure logged");
        assert!(line.contains("ERROR"));
        assert!(line.contains("critical"));
        assert!(line.contains("absent.toml"));
    }
}
