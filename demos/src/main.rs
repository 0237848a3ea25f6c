use anyhow::Context;
use clap::Parser;
use demos::Script;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trapeze::prelude::*;

/// Drive the test-paper endpoints with a ramp-shaped load profile.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Scenario file (JSON). Profile flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "generate-test-papers")]
    script: Script,

    /// Base URL of the backend.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    host: String,

    /// Address of the web front end, sent as Origin and Referer.
    #[arg(long)]
    origin: Option<String>,

    #[arg(long, env = "TRAPEZE_TOKEN")]
    token: String,

    #[arg(short, long)]
    users: Option<u32>,

    /// Users started per second.
    #[arg(short, long)]
    ramp_rate: Option<f64>,

    #[arg(short, long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    tick: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    drain_timeout: Duration,

    #[arg(long, value_parser = humantime::parse_duration)]
    think_time: Option<Duration>,

    /// Print the final statistics as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn scenario_config(&self) -> anyhow::Result<ScenarioConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => ScenarioConfig::new(
                "generate-test-paper",
                LoadProfile::trapezoidal(50, 5., Duration::from_secs(600)),
            ),
        };

        if let Some(users) = self.users {
            config.profile.users = users;
        }
        if let Some(rate) = self.ramp_rate {
            config.profile.ramp_rate = rate;
        }
        if let Some(duration) = self.duration {
            config.profile.duration = duration;
        }
        Ok(config)
    }

    fn run_config(&self) -> RunConfig {
        let config = RunConfig::default()
            .tick_interval(self.tick)
            .drain_timeout(self.drain_timeout);
        match self.think_time {
            Some(pause) => config.think_time(pause),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trapeze=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.scenario_config()?;
    let scenario = demos::scenario(cli.script, &cli.host, cli.origin.as_deref(), &cli.token)?;
    info!("Running {:?} against {}: {}", cli.script, cli.host, config.profile);

    let mut handle = Engine::new(config)
        .config(cli.run_config())
        .sink(TracingSink)
        .start(scenario)?;

    let mut progress = tokio::time::interval(Duration::from_secs(10));
    let mut interrupted = false;
    let stats = loop {
        let interrupt = tokio::select! {
            stats = &mut handle => break stats?,
            _ = progress.tick() => false,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(err) = signal {
                    warn!("Failed to listen for ctrl-c: {err}");
                }
                true
            }
        };

        if interrupt {
            interrupted = true;
            info!("Interrupted, draining virtual users");
            handle.request_stop();
        } else {
            info!("{}", handle.status());
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{stats}");
    }
    Ok(())
}
