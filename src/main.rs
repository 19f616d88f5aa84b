use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use signalsift::config::{EngineConfig, LoggingConfig};
use signalsift::detect::pattern::{Matcher, Signature};
use signalsift::detect::{Detector, Sensitivity, Severity};
use signalsift::job::JobState;
use signalsift::record::TimeRange;
use signalsift::sources::memory::MemorySource;
use signalsift::sources::DataSourceRef;
use signalsift::storage::SqliteStore;

#[derive(Parser)]
#[command(
    name = "signalsift",
    about = "Multi-detector anomaly detection for logs and operational records",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $SIGNALSIFT_CONFIG, ./signalsift.toml, /etc/signalsift/signalsift.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true, env = "SIGNALSIFT_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one analysis job and print its anomalies
    Analyze {
        /// Connector type (jsonl, memory)
        #[arg(long, default_value = "jsonl")]
        source: String,

        /// Connector location, e.g. a file path
        #[arg(long)]
        location: String,

        /// low, medium or high
        #[arg(long)]
        sensitivity: Option<Sensitivity>,

        /// Comma-separated detectors (statistical,pattern,semantic)
        #[arg(long, value_delimiter = ',')]
        detectors: Option<Vec<Detector>>,

        /// Only records at or after this RFC 3339 time
        #[arg(long, requires = "to")]
        from: Option<DateTime<Utc>>,

        /// Only records at or before this RFC 3339 time
        #[arg(long, requires = "from")]
        to: Option<DateTime<Utc>>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Start the daemon (job queue + API server)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect stored jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Manage the signature library
    Signatures {
        #[command(subcommand)]
        action: SignatureAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List recent jobs
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one job and its anomalies
    Show {
        id: uuid::Uuid,

        /// Only anomalies of this tier (low, medium, high, critical)
        #[arg(long)]
        severity: Option<Severity>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SignatureAction {
    /// List signatures in registration order
    List,

    /// Register a new signature
    Add {
        #[arg(long)]
        id: String,

        #[arg(long)]
        name: String,

        /// Regular expression to match
        #[arg(long, conflicts_with = "literal", required_unless_present = "literal")]
        regex: Option<String>,

        /// Literal text to match
        #[arg(long)]
        literal: Option<String>,

        /// Case-insensitive literal match
        #[arg(long)]
        case_insensitive: bool,

        /// Lower runs first
        #[arg(long, default_value = "100")]
        priority: i32,

        /// Base severity weight in [0, 1]
        #[arg(long)]
        weight: f64,

        #[arg(long, default_value = "custom")]
        category: String,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Analyze {
            source,
            location,
            sensitivity,
            detectors,
            from,
            to,
            json,
        } => {
            if let Some(s) = sensitivity {
                config.analysis.sensitivity = s;
            }
            if let Some(d) = detectors {
                config.analysis.detectors = d.into_iter().collect();
            }
            let range = match (from, to) {
                (Some(start), Some(end)) => Some(TimeRange { start, end }),
                _ => None,
            };
            analyze(config, DataSourceRef::new(source, location), range, json).await?;
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting signalsift daemon");
            signalsift::serve(config).await?;
        }
        Commands::Jobs { action } => {
            let store = SqliteStore::open(&config.storage.path)?;
            match action {
                JobsAction::List { limit } => {
                    let jobs = store.list_jobs(limit)?;
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<36} | {:<17} | {:<9} | {:<8} | Location", "Id", "State", "Anomalies", "Source");
                        println!("{:-<36}-|-{:-<17}-|-{:-<9}-|-{:-<8}-|-{:-<20}", "", "", "", "", "");
                        for j in jobs {
                            println!(
                                "{:<36} | {:<17} | {:<9} | {:<8} | {}",
                                j.id, j.state, j.anomaly_count, j.source_kind, j.location
                            );
                        }
                    }
                }
                JobsAction::Show { id, severity, json } => {
                    let job = store
                        .load_job(id)?
                        .with_context(|| format!("job {} not found", id))?;
                    let anomalies = store.query_anomalies(id, severity)?;
                    if json {
                        let out = serde_json::json!({ "job": job, "anomalies": anomalies });
                        println!("{}", serde_json::to_string_pretty(&out)?);
                    } else {
                        print_report(&job, &anomalies);
                    }
                }
            }
        }
        Commands::Signatures { action } => {
            let store = SqliteStore::open(&config.storage.path)?;
            match action {
                SignatureAction::List => {
                    println!("{:<20} | {:<8} | {:<6} | {:<12} | Name", "Id", "Priority", "Weight", "Category");
                    println!("{:-<20}-|-{:-<8}-|-{:-<6}-|-{:-<12}-|-{:-<20}", "", "", "", "", "");
                    for s in store.list_signatures()? {
                        println!(
                            "{:<20} | {:<8} | {:<6.2} | {:<12} | {}",
                            s.id, s.priority, s.weight, s.category, s.name
                        );
                    }
                }
                SignatureAction::Add {
                    id,
                    name,
                    regex,
                    literal,
                    case_insensitive,
                    priority,
                    weight,
                    category,
                } => {
                    let matcher = match (regex, literal) {
                        (Some(pattern), _) => Matcher::Regex { pattern },
                        (None, Some(text)) => Matcher::Literal {
                            text,
                            case_insensitive,
                        },
                        (None, None) => anyhow::bail!("either --regex or --literal is required"),
                    };
                    let signature = Signature {
                        id: id.clone(),
                        name,
                        matcher,
                        priority,
                        weight,
                        category,
                    };
                    store.add_signature(&signature)?;
                    println!("Signature '{}' added.", id);
                }
            }
        }
    }

    Ok(())
}

async fn analyze(mut config: EngineConfig, source: DataSourceRef, range: Option<TimeRange>, json: bool) -> Result<()> {
    let store = SqliteStore::open(&config.storage.path)?;
    let orchestrator = signalsift::build_orchestrator(&mut config, &store, MemorySource::new())?;

    let (job, handle) = orchestrator.prepare(source, range, config.analysis.clone());
    tracing::info!(job_id = %job.id, "Running analysis job");
    let outcome = orchestrator.run(job, &handle).await?;

    if json {
        let out = serde_json::json!({ "job": outcome.job, "anomalies": outcome.anomalies });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&outcome.job, &outcome.anomalies);
    }

    if let Some(failure) = outcome.failure {
        anyhow::bail!("job {} failed: {}", outcome.job.id, failure);
    }
    Ok(())
}

fn print_report(job: &signalsift::job::AnalysisJob, anomalies: &[signalsift::detect::aggregate::Anomaly]) {
    println!("\n=== signalsift Analysis Report ===");
    println!("Job:     {}", job.id);
    println!("Source:  {} {}", job.data_source_ref.kind, job.data_source_ref.location);
    println!("State:   {}", job.state);
    if let Some(m) = &job.metrics {
        println!(
            "Records: {}   Anomalies: {}   Rate: {:.4}",
            m.records_analyzed, m.anomalies_total, m.anomaly_rate
        );
    }
    if !job.degraded_detectors.is_empty() {
        let degraded: Vec<String> = job.degraded_detectors.iter().map(|d| d.to_string()).collect();
        println!("Degraded: {}", degraded.join(", "));
    }
    for entry in &job.error_log {
        println!(" ! [{}] {}: {}", entry.stage, entry.kind, entry.message);
    }

    if anomalies.is_empty() {
        if job.state != JobState::Failed {
            println!("\nNo anomalies found.");
        }
    } else {
        println!("\n{:<8} | {:<5} | {:<16} | {:<24} | Rationale", "Severity", "Score", "Fingerprint", "Detectors");
        println!("{:-<8}-|-{:-<5}-|-{:-<16}-|-{:-<24}-|-{:-<30}", "", "", "", "", "");
        for a in anomalies {
            let detectors: Vec<String> = a.contributing_detectors.iter().map(|d| d.to_string()).collect();
            println!(
                "{:<8} | {:<5.2} | {:<16} | {:<24} | {}",
                a.severity.to_string(),
                a.combined_score,
                a.fingerprint,
                detectors.join(","),
                a.rationale
            );
        }
    }
    if let Some(report) = &job.report {
        println!("\nSummary ({}):", report.source);
        for line in report.summary.lines() {
            println!("  {}", line);
        }
        println!("Recommendations:");
        for (i, rec) in report.recommendations.iter().enumerate() {
            println!("  {}. {}", i + 1, rec);
        }
    }
    println!("==================================\n");
}
