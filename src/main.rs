use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use pawnboard::api::HttpRateSource;
use pawnboard::cache::FileStore;
use pawnboard::config::Settings;
use pawnboard::digits::reconcile;
use pawnboard::models::DigitWorkItem;
use pawnboard::scheduler::{Scheduler, SchedulerHandle, Trigger, UpdateTask};
use pawnboard::sync::Synchronizer;
use pawnboard::Snapshot;

type Board = Synchronizer<HttpRateSource, FileStore>;

#[derive(Parser)]
#[command(name = "pawnboard", version, about = "Pawnshop precious-metal price board")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Print boards as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh once and print the board (default)
    Show,
    /// Refresh at the scheduled hours until Ctrl-C (SIGUSR1 refreshes now)
    Watch,
    /// Print the cached board without going to the network
    Cache,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    cli.settings.logging().init();

    let settings = cli.settings;
    let view = View {
        json: cli.json,
        offset: settings.display_offset,
    };
    let board = Arc::new(Synchronizer::new(
        HttpRateSource::new(settings.rates_url.clone(), settings.http_timeout()),
        FileStore::new(settings.cache_file.clone()),
    ));

    match cli.command.unwrap_or(Command::Show) {
        Command::Show => {
            let snapshot = board.refresh().await?;
            println!("{}", render(&snapshot, &view)?);
        }
        Command::Cache => {
            let snapshot = board.cached_snapshot().await?;
            println!("{}", render(&snapshot, &view)?);
        }
        Command::Watch => {
            let task = Arc::new(BoardRefresh { board, view });
            task.run(Trigger::Manual).await;

            let handle = Scheduler::new(settings.fire_hours.clone()).start(task);
            info!(hours = ?settings.fire_hours.hours(), "Watching rates");
            wait_for_shutdown(&handle).await;

            info!("Shutdown signal received");
            handle.shutdown().await;
        }
    }

    Ok(())
}

struct BoardRefresh {
    board: Arc<Board>,
    view: View,
}

#[async_trait]
impl UpdateTask for BoardRefresh {
    async fn run(&self, trigger: Trigger) {
        info!(?trigger, "Refreshing board");
        match self.board.refresh().await {
            Ok(snapshot) => match render(&snapshot, &self.view) {
                Ok(text) => println!("{text}"),
                Err(e) => error!(error = %e, "Failed to render board"),
            },
            Err(e) => error!(error = %e, ?trigger, "Refresh failed"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(handle: &SchedulerHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut manual = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Cannot listen for SIGUSR1");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => return,
            Some(()) = manual.recv() => handle.trigger_now(),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handle: &SchedulerHandle) {
    let _ = signal::ctrl_c().await;
}

/// How boards are printed.
#[derive(Debug, Clone, Copy)]
struct View {
    json: bool,
    offset: FixedOffset,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BoardReport<'a> {
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    stale: bool,
    add_digits: Vec<DigitWorkItem>,
}

fn render(snapshot: &Snapshot, view: &View) -> anyhow::Result<String> {
    let stale = snapshot.is_stale(Utc::now());
    let add_digits = reconcile(&snapshot.current, &snapshot.previous);

    if view.json {
        let report = BoardReport {
            snapshot,
            stale,
            add_digits,
        };
        return Ok(serde_json::to_string_pretty(&report)?);
    }

    let mut out = String::new();
    writeln!(
        out,
        "Rates as of {}{}",
        local_time(snapshot.last_updated, view.offset),
        if stale { " (stale)" } else { "" }
    )?;
    for rate in snapshot.board_order() {
        writeln!(
            out,
            "  {:<12} {:>10}  {}",
            rate.label,
            group_thousands(rate.price),
            snapshot.price_change(&rate.code)
        )?;
    }
    if let Some(previous) = snapshot.previous_updated {
        writeln!(out, "Previous rates from {}", local_time(previous, view.offset))?;
    }

    if add_digits.is_empty() {
        write!(out, "Board: nothing to add")?;
    } else {
        let tiles: Vec<String> = add_digits.iter().map(ToString::to_string).collect();
        write!(out, "Board: add {}", tiles.join(" "))?;
    }
    Ok(out)
}

fn local_time(instant: DateTime<Utc>, offset: FixedOffset) -> String {
    instant
        .with_timezone(&offset)
        .format("%d.%m.%Y %H:%M")
        .to_string()
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(c);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pawnboard::RateRecord;

    fn view(json: bool) -> View {
        View {
            json,
            offset: FixedOffset::east_opt(5 * 3600).unwrap(),
        }
    }

    #[test]
    fn groups_thousands_with_spaces() {
        assert_eq!(group_thousands(7), "7");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(41000), "41 000");
        assert_eq!(group_thousands(1234567), "1 234 567");
    }

    #[test]
    fn times_are_shown_at_the_display_offset() {
        let instant = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();

        assert_eq!(local_time(instant, view(false).offset), "02.03.2026 12:00");
        assert_eq!(
            local_time(instant, FixedOffset::west_opt(3600).unwrap()),
            "02.03.2026 06:00"
        );
    }

    #[test]
    fn text_board_lists_changes_and_digits() {
        let snapshot = Snapshot {
            current: vec![
                RateRecord::new("585", "Au 585", 24000),
                RateRecord::new("999", "Au 999", 41500),
            ],
            previous: vec![
                RateRecord::new("585", "Au 585", 24000),
                RateRecord::new("999", "Au 999", 41000),
            ],
            last_updated: Utc::now(),
            previous_updated: Some(Utc::now()),
        };

        let text = render(&snapshot, &view(false)).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[1].contains("Au 999"));
        assert!(lines[1].contains("41 500"));
        assert!(lines[1].ends_with("+500"));
        assert!(lines[2].contains("Au 585") && lines[2].ends_with('='));
        assert_eq!(lines.last().copied(), Some("Board: add 5×1"));
    }

    #[test]
    fn json_board_carries_digits_and_staleness() {
        let snapshot = Snapshot {
            current: vec![RateRecord::new("585", "Au 585", 24000)],
            previous: vec![],
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
            previous_updated: None,
        };

        let value: serde_json::Value =
            serde_json::from_str(&render(&snapshot, &view(true)).unwrap()).unwrap();

        assert_eq!(value["stale"], true);
        assert_eq!(value["addDigits"][0]["digit"], "0");
        assert_eq!(value["addDigits"][0]["count"], 3);
        assert_eq!(value["current"][0]["code"], "585");
    }
}
