use choronzon_core::config::ChoronzonConfig;
use choronzon_core::scheduler::{Engine, EngineError, RunOutcome};
use choronzon_core::{Campaign, FormatPlugin, PngPlugin, TargetExecutor};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_TRACER_BUDGET: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[clap(name = "choronzon", version, about = "Evolutionary knowledge-based file-format fuzzer")]
struct Cli {
    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Prepare the run directory described by the configuration.
    Init { config: PathBuf },
    /// Fuzz until interrupted or the generation cap is reached.
    Run { config: PathBuf },
    /// Continue a campaign from its latest checkpoint.
    Resume { config: PathBuf },
    /// Re-execute one corpus member and report its coverage.
    Replay {
        config: PathBuf,
        /// Member uid as printed in the logs (hex, with or without 0x).
        uid: String,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let code = match cli.command {
        CliCommand::Init { config } => cmd_init(&config),
        CliCommand::Run { config } => cmd_run(&config, false),
        CliCommand::Resume { config } => cmd_run(&config, true),
        CliCommand::Replay { config, uid } => cmd_replay(&config, &uid),
    };
    ExitCode::from(code)
}

fn load_config(path: &Path) -> Option<ChoronzonConfig> {
    match ChoronzonConfig::load_from_file(path) {
        Ok(config) => Some(config),
        Err(e) => {
            log::error!("{e}");
            None
        }
    }
}

fn make_plugin(name: &str) -> Option<Box<dyn FormatPlugin>> {
    match name {
        "png" => Some(Box::new(PngPlugin)),
        other => {
            log::error!("unknown format plug-in: {other}");
            None
        }
    }
}

fn build_engine(
    config: &ChoronzonConfig,
    campaign: Campaign,
) -> Option<Engine<TargetExecutor>> {
    let plugin = make_plugin(&config.campaign.format)?;
    let executor = TargetExecutor::new(
        config.target.command.clone(),
        campaign.input_path(),
        campaign.fifo_path(),
        Duration::from_millis(config.engine.trial_timeout_ms),
        Duration::from_millis(config.engine.grace_ms),
    );
    Some(Engine::new(
        config.engine.clone(),
        &config.weights,
        plugin,
        executor,
        campaign,
    ))
}

fn cmd_init(config_path: &Path) -> u8 {
    let Some(config) = load_config(config_path) else {
        return EXIT_CONFIG;
    };
    match Campaign::init(&config.campaign.dir) {
        Ok(campaign) => {
            log::info!("run directory prepared at {:?}", campaign.dir());
            EXIT_OK
        }
        Err(e) => {
            log::error!("init failed: {e}");
            EXIT_CONFIG
        }
    }
}

fn cmd_run(config_path: &Path, resume: bool) -> u8 {
    let Some(config) = load_config(config_path) else {
        return EXIT_CONFIG;
    };
    let campaign = match Campaign::open(&config.campaign.dir) {
        Ok(campaign) => campaign,
        Err(e) => {
            log::error!("{e}");
            return EXIT_CONFIG;
        }
    };
    let Some(mut engine) = build_engine(&config, campaign) else {
        return EXIT_CONFIG;
    };

    if let Err(e) = install_interrupt_handler(&engine) {
        log::error!("failed to install interrupt handler: {e}");
        return EXIT_CONFIG;
    }

    if resume {
        match engine.resume() {
            Ok(true) => {}
            Ok(false) => {
                log::error!("no checkpoint to resume from; use `run` to start fresh");
                return EXIT_CONFIG;
            }
            Err(e) => {
                log::error!("resume failed: {e}");
                return EXIT_CONFIG;
            }
        }
    } else {
        match engine.load_seeds(&config.campaign.seeds) {
            Ok(count) => log::info!("loaded {count} seed(s)"),
            Err(e) => {
                log::error!("campaign start failed: {e}");
                return EXIT_CONFIG;
            }
        }
    }

    match engine.run() {
        Ok(RunOutcome::Completed) => {
            report(&engine);
            EXIT_OK
        }
        Ok(RunOutcome::Interrupted) => {
            log::info!("interrupted; checkpoint flushed");
            report(&engine);
            EXIT_INTERRUPTED
        }
        Err(EngineError::FailureBudgetExceeded(n)) => {
            log::error!("aborting: {n} consecutive tracer failures");
            EXIT_TRACER_BUDGET
        }
        Err(e) => {
            log::error!("campaign failed: {e}");
            EXIT_CONFIG
        }
    }
}

fn cmd_replay(config_path: &Path, uid_text: &str) -> u8 {
    let Some(config) = load_config(config_path) else {
        return EXIT_CONFIG;
    };
    let uid = match parse_uid(uid_text) {
        Ok(uid) => uid,
        Err(e) => {
            log::error!("{e:#}");
            return EXIT_CONFIG;
        }
    };
    let campaign = match Campaign::open(&config.campaign.dir) {
        Ok(campaign) => campaign,
        Err(e) => {
            log::error!("{e}");
            return EXIT_CONFIG;
        }
    };
    let Some(mut engine) = build_engine(&config, campaign) else {
        return EXIT_CONFIG;
    };

    match engine.replay(uid) {
        Ok(trace) => {
            log::info!(
                "replay of {uid:#018x}: {} distinct blocks, termination {}",
                trace.coverage.len(),
                trace.termination
            );
            EXIT_OK
        }
        Err(e) => {
            log::error!("replay failed: {e}");
            EXIT_CONFIG
        }
    }
}

fn install_interrupt_handler(engine: &Engine<TargetExecutor>) -> Result<(), ctrlc::Error> {
    let flag = engine.interrupt_flag();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received; finishing the current trial");
        flag.store(true, Ordering::SeqCst);
    })
}

fn parse_uid(text: &str) -> anyhow::Result<u64> {
    let trimmed = text.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).with_context(|| format!("uid `{text}` is not a hex number"))
}

fn report(engine: &Engine<TargetExecutor>) {
    let stats = engine.stats();
    log::info!(
        "totals: {} trials, {} admitted, {} crashes, {} discarded, corpus {}, crash sites {}",
        stats.trials,
        stats.admitted,
        stats.crashes,
        stats.discarded,
        engine.corpus().len(),
        engine.corpus().crashes().len()
    );
}
