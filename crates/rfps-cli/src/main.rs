use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use rfps_sync::ScrapeWindow;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rfps")]
#[command(about = "RFP scraper command-line interface")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch opportunities for a posted-date window.
    #[command(subcommand)]
    Scrape(ScrapeSource),
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum ScrapeSource {
    /// SAM.gov opportunity search. Defaults to the 24 hours ending now.
    Sam {
        #[arg(long, value_parser = parse_cli_datetime)]
        start: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_cli_datetime)]
        end: Option<DateTime<Utc>>,
    },
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD[T ]HH:MM:SS`, or RFC 3339. Values
/// without an offset are taken as UTC.
fn parse_cli_datetime(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc());
    }
    bail!("expected YYYY-MM-DD, YYYY-MM-DDTHH:MM:SS or RFC 3339, got {raw:?}")
}

fn resolve_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ScrapeWindow {
    let trailing = ScrapeWindow::trailing_day(end.unwrap_or(now));
    ScrapeWindow::new(start.unwrap_or(trailing.start_time), trailing.end_time)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RFPS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scrape(ScrapeSource::Sam { start, end }) => {
            let window = resolve_window(start, end, Utc::now());
            let summary = rfps_sync::run_scrape_once_from_env(window).await?;
            println!(
                "scrape complete: run_id={} opportunities={} reported_total={} pages={} drift={} persisted={} output={}",
                summary.run_id,
                summary.opportunities,
                summary.reported_total,
                summary.pages_fetched,
                summary.drift,
                summary.persisted,
                summary.artifact_path
            );
        }
        Commands::Migrate => {
            rfps_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(err) = run(cli).await {
        error!(error = format!("{err:#}"), "fatal error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_dates_and_datetimes_as_utc() {
        let midnight = Utc.with_ymd_and_hms(2025, 4, 28, 0, 0, 0).single().unwrap();
        assert_eq!(parse_cli_datetime("2025-04-28").unwrap(), midnight);
        assert_eq!(
            parse_cli_datetime("2025-04-28T13:45:00").unwrap(),
            Utc.with_ymd_and_hms(2025, 4, 28, 13, 45, 0).single().unwrap()
        );
        assert_eq!(
            parse_cli_datetime("2025-04-28 13:45:00").unwrap(),
            Utc.with_ymd_and_hms(2025, 4, 28, 13, 45, 0).single().unwrap()
        );
        assert_eq!(
            parse_cli_datetime("2025-04-28T02:00:00+02:00").unwrap(),
            midnight
        );
        assert!(parse_cli_datetime("04/28/2025").is_err());
    }

    #[test]
    fn window_defaults_to_trailing_day() {
        let now = Utc.with_ymd_and_hms(2025, 4, 29, 8, 0, 0).single().unwrap();
        let window = resolve_window(None, None, now);
        assert_eq!(window.end_time, now);
        assert_eq!(window.start_time, Utc.with_ymd_and_hms(2025, 4, 28, 8, 0, 0).single().unwrap());

        let start = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single().unwrap();
        let window = resolve_window(Some(start), None, now);
        assert_eq!(window.start_time, start);
        assert_eq!(window.end_time, now);
    }

    #[test]
    fn scrape_sam_accepts_start_and_end() {
        let cli = Cli::try_parse_from([
            "rfps", "scrape", "sam", "--start", "2025-04-28", "--end", "2025-04-29",
        ])
        .expect("parses");
        match cli.command {
            Commands::Scrape(ScrapeSource::Sam { start, end }) => {
                assert_eq!(start.unwrap().date_naive(), NaiveDate::from_ymd_opt(2025, 4, 28).unwrap());
                assert_eq!(end.unwrap().date_naive(), NaiveDate::from_ymd_opt(2025, 4, 29).unwrap());
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["rfps", "scrape", "sam", "--start", "yesterday"]).is_err());
    }
}
