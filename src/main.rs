use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use prepa_etl::config::PipelineConfig;
use prepa_etl::logging;
use prepa_etl::pipeline::{DataSource, PipelineRun, Stage, StageOutcome};
use prepa_etl::warehouse::{InMemoryWarehouse, SqliteWarehouse, Warehouse};

#[derive(Parser)]
#[command(name = "prepa_etl")]
#[command(about = "Student learning-analytics feature pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the flat-file source CSVs
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// SQLite warehouse file; omit to run against an in-memory warehouse
    #[arg(long)]
    db: Option<PathBuf>,

    /// Pipeline configuration document (JSON)
    #[arg(long, default_value = "config/pipeline.json")]
    config: PathBuf,

    /// Where fitted encoding/scaling parameters are persisted
    #[arg(long, default_value = "config/fitted_params.json")]
    params: PathBuf,

    /// Refit encodings and scaling even when persisted parameters exist
    #[arg(long)]
    refit: bool,

    /// Read from the warehouse event store instead of flat files
    #[arg(long)]
    from_events: bool,

    /// Source tag to select when reading from the event store
    #[arg(long, default_value = "oulad")]
    source_tag: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every pipeline stage in order
    Run,
    /// Run a single stage. Available: schema, extract, validate, clean,
    /// encode, aggregate, normalize, load
    Stage {
        name: String,
    },
}

fn print_outcome(stage: Stage, outcome: &StageOutcome) {
    match outcome {
        StageOutcome::Completed(summary) => {
            println!(
                "   ✅ {}: {} rows in, {} rows out",
                stage.as_str(),
                summary.rows_in,
                summary.rows_out
            );
            for note in &summary.notes {
                println!("      - {}", note);
            }
        }
        StageOutcome::Skipped(reason) => {
            println!("   ⏭️  {}: skipped ({})", stage.as_str(), reason);
        }
        StageOutcome::Failed(reason) => {
            println!("   ❌ {}: failed ({})", stage.as_str(), reason);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();

    let warehouse: Arc<dyn Warehouse> = match &cli.db {
        Some(path) => {
            info!("Opening warehouse at {}", path.display());
            Arc::new(SqliteWarehouse::open(path)?)
        }
        None => {
            info!("No --db given; using in-memory warehouse");
            Arc::new(InMemoryWarehouse::new())
        }
    };

    let config = PipelineConfig::load(&cli.config);
    let source = if cli.from_events {
        DataSource::EventStore {
            source_tag: cli.source_tag.clone(),
        }
    } else {
        DataSource::FlatFiles(cli.data_dir.clone())
    };
    let run = PipelineRun::new(warehouse, config, source, cli.params.clone(), cli.refit);

    match cli.command {
        Commands::Run => {
            println!("🔄 Running full pipeline...");
            let report = run.run().await;
            println!("\n📊 Pipeline run {}:", report.run_id);
            for (stage, outcome) in &report.stages {
                print_outcome(*stage, outcome);
            }
            println!(
                "\n   {} completed, {} failed, started {} finished {}",
                report.completed(),
                report.failed(),
                report.started_at.format("%H:%M:%S"),
                report.finished_at.format("%H:%M:%S")
            );
        }
        Commands::Stage { name } => {
            let stage = Stage::from_str(&name)?;
            println!("🔄 Running stage '{}'...", stage.as_str());
            let outcome = run.run_stage(stage).await;
            println!();
            print_outcome(stage, &outcome);
        }
    }
    Ok(())
}
