use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use aqua_pipeline::{PipelineConfig, Services, Session};
use aqua_storage::PgDocumentStore;
use chrono::{FixedOffset, Local};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "aqua-cli")]
#[command(about = "AquaSense command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web server.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Print aggregated metrics for a project.
    Metrics {
        #[command(flatten)]
        target: ProjectArgs,
        /// Emit the metrics as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Export a project's analyses as CSV.
    Export {
        #[command(flatten)]
        target: ProjectArgs,
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load a project's analyses and repair broken image links.
    Reconcile {
        #[command(flatten)]
        target: ProjectArgs,
    },
}

#[derive(Debug, Args)]
struct ProjectArgs {
    /// Act as this user.
    #[arg(long)]
    user: String,
    #[arg(long)]
    project: String,
    /// Minutes east of UTC used for day boundaries; local time when omitted.
    #[arg(long, allow_hyphen_values = true)]
    tz_offset_minutes: Option<i32>,
}

impl ProjectArgs {
    fn session(&self) -> Result<Session> {
        Ok(Session::new(&self.user)?)
    }

    /// `None` means local time, applied per record.
    fn offset(&self) -> Result<Option<FixedOffset>> {
        self.tz_offset_minutes
            .map(|minutes| {
                minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| anyhow!("invalid --tz-offset-minutes {minutes}"))
            })
            .transpose()
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("AQUA_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => aqua_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set");
            };
            PgDocumentStore::connect(url).await?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Metrics { target, json } => {
            let services = Services::from_env().await?;
            let session = target.session()?;
            let records = &services.records;
            let metrics = match target.offset()? {
                Some(tz) => records.project_metrics(&session, &target.project, &tz).await?,
                None => records.project_metrics_local(&session, &target.project).await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!(
                    "analyses={} avg_confidence={:.1}%",
                    metrics.total_analyses,
                    metrics.avg_confidence * 100.0
                );
                for species in &metrics.species_breakdown {
                    println!("  {:<24} {:>5} {:>6.1}%", species.name, species.count, species.percentage);
                }
                for bucket in &metrics.confidence_distribution {
                    println!("  confidence {:<8} {:>5}", bucket.range, bucket.count);
                }
                for point in &metrics.timeline_data {
                    println!("  {} {:>5}", point.date, point.count);
                }
            }
        }
        Commands::Export { target, out } => {
            let services = Services::from_env().await?;
            let session = target.session()?;
            let records = &services.records;
            let csv = match target.offset()? {
                Some(tz) => records.export_project_csv(&session, &target.project, &tz).await?,
                None => records.export_project_csv(&session, &target.project, &Local).await?,
            };
            match out {
                Some(path) => {
                    tokio::fs::write(&path, csv)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "csv written");
                }
                None => print!("{csv}"),
            }
        }
        Commands::Reconcile { target } => {
            let services = Services::from_env().await?;
            let (records, summary) = services
                .records
                .load_project_records_with_summary(&target.session()?, &target.project)
                .await?;
            println!(
                "reconcile complete: records={} usable={} repaired={} missing={}",
                records.len(),
                summary.usable,
                summary.repaired,
                summary.missing
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(tz_offset_minutes: Option<i32>) -> ProjectArgs {
        ProjectArgs {
            user: "owner".into(),
            project: "p1".into(),
            tz_offset_minutes,
        }
    }

    #[test]
    fn missing_offset_defers_to_local_time() {
        assert_eq!(target(None).offset().unwrap(), None);
        assert_eq!(
            target(Some(-300)).offset().unwrap(),
            FixedOffset::west_opt(5 * 3600)
        );
        assert!(target(Some(100_000)).offset().is_err());
    }

    #[test]
    fn project_commands_parse_negative_offsets() {
        let cli = Cli::parse_from([
            "aqua-cli",
            "export",
            "--user",
            "owner",
            "--project",
            "p1",
            "--tz-offset-minutes",
            "-120",
        ]);
        let Some(Commands::Export { target, out }) = cli.command else {
            panic!("expected export");
        };
        assert_eq!(target.tz_offset_minutes, Some(-120));
        assert!(out.is_none());
    }
}
