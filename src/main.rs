#![allow(clippy::result_large_err)]

use anyhow::Context;
use chrono::Utc;
use deferhook::config::DeferhookConfig;
use deferhook::domain::TimerDuration;
use deferhook::{app, telemetry};
use std::time::Duration;
use uuid::Uuid;

enum CliCommand {
    Consumer,
    Poller,
    Trigger,
    Schedule { duration: TimerDuration, url: String },
    Status { id: Uuid },
    Help,
}

impl CliCommand {
    fn service_name(&self) -> &'static str {
        match self {
            CliCommand::Consumer => "consumer",
            CliCommand::Poller => "poller",
            CliCommand::Trigger => "trigger",
            CliCommand::Schedule { .. } => "schedule",
            CliCommand::Status { .. } => "status",
            CliCommand::Help => "cli",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = parse_cli_args()?;
    if matches!(command, CliCommand::Help) {
        print_help();
        return Ok(());
    }

    telemetry::init_tracing(command.service_name()).context("failed to initialise telemetry")?;
    let config = DeferhookConfig::load().context("failed to load configuration")?;

    match command {
        CliCommand::Consumer => app::run_consumer(&config)
            .await
            .context("ingestion consumer failed"),
        CliCommand::Poller => app::run_poller(&config)
            .await
            .context("expiry poller failed"),
        CliCommand::Trigger => app::run_trigger(&config)
            .await
            .context("trigger service failed"),
        CliCommand::Schedule { duration, url } => {
            let timer = app::schedule(&config, duration, &url)
                .await
                .context("failed to schedule timer")?;
            println!("{} fires at {}", timer.id, timer.fire_at.to_rfc3339());
            Ok(())
        }
        CliCommand::Status { id } => {
            match app::status(&config, id)
                .await
                .context("failed to read timer status")?
            {
                Some(timer) => {
                    let left = Duration::from_secs(timer.time_left(Utc::now()));
                    println!(
                        "{} url={} fire_at={} time_left={}",
                        timer.id,
                        timer.url,
                        timer.fire_at.to_rfc3339(),
                        humantime::format_duration(left)
                    );
                }
                None => println!("timer {id} not found"),
            }
            Ok(())
        }
        CliCommand::Help => Ok(()),
    }
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Help);
    };

    match first.as_str() {
        "consumer" => Ok(CliCommand::Consumer),
        "poller" => Ok(CliCommand::Poller),
        "trigger" => Ok(CliCommand::Trigger),
        "schedule" => parse_schedule_args(args),
        "status" => {
            let raw = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("expected timer id after status"))?;
            let id = Uuid::parse_str(&raw).with_context(|| format!("`{raw}` is not a UUID"))?;
            Ok(CliCommand::Status { id })
        }
        "-h" | "--help" | "help" => Ok(CliCommand::Help),
        other => anyhow::bail!("unrecognised command `{other}`"),
    }
}

fn parse_schedule_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let (mut hours, mut minutes, mut seconds) = (0u32, 0u32, 0u32);
    let mut url = None;

    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("expected value after {arg}"))
        };
        match arg.as_str() {
            "--hours" => hours = parse_component(&arg, value()?)?,
            "--minutes" => minutes = parse_component(&arg, value()?)?,
            "--seconds" => seconds = parse_component(&arg, value()?)?,
            "--url" => url = Some(value()?),
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    let url = url.ok_or_else(|| anyhow::anyhow!("schedule requires --url"))?;
    let duration = TimerDuration::new(hours, minutes, seconds)?;
    Ok(CliCommand::Schedule { duration, url })
}

fn parse_component(flag: &str, raw: String) -> anyhow::Result<u32> {
    raw.parse()
        .with_context(|| format!("{flag} expects a non-negative integer, got `{raw}`"))
}

fn print_help() {
    println!(
        "\
Usage: deferhook <COMMAND>

Commands:
  consumer               Record timers from the incoming queue
  poller                 Hand due timers to the to-fire queue
  trigger                POST callbacks for fired timers
  schedule --url <URL> [--hours N] [--minutes N] [--seconds N]
                         Publish a new timer to the incoming queue
  status <ID>            Show a stored timer and its time left
  -h, --help             Print this help message

Configuration is read from config/local.(toml|yaml) and DEFERHOOK__* variables,
e.g. DEFERHOOK__BROKER__HOST=rabbitmq.
"
    );
}
