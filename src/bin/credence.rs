#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use credence_harness::cache::SqliteSampleCache;
use credence_harness::config::RunConfig;
use credence_harness::elicit::GatewayExecutor;
use credence_harness::estimator::{estimate_with_options, EstimateSession};
use credence_harness::gateway::ProviderGateway;
use credence_harness::templates::TemplateCatalog;
use credence_harness::trace::{JsonlTraceSink, TraceSink};
use credence_harness::worklist::build_worklist;

#[derive(Parser)]
#[command(name = "credence", version, about = "Credence harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate a model's belief in a claim
    ///
    /// Runs K paraphrased probes with R replicates each, aggregates in
    /// log-odds space, and writes a session JSON (estimate + sample
    /// snapshot) that `refine` can recompute the interval from.
    Estimate {
        /// Path to a run request JSON (alternative to --claim/--model)
        #[arg(long, group = "input")]
        request: Option<PathBuf>,

        /// Inline claim text
        #[arg(long, group = "input")]
        claim: Option<String>,

        /// OpenRouter model ID
        #[arg(long)]
        model: Option<String>,

        /// Paraphrase slots K
        #[arg(long)]
        slots: Option<usize>,

        /// Replicates R per slot
        #[arg(long)]
        replicates: Option<usize>,

        /// Bootstrap replicas B
        #[arg(long)]
        bootstrap_replicas: Option<u32>,

        /// Bootstrap seed (overrides CREDENCE_SEED and the derived value)
        #[arg(long)]
        seed: Option<u64>,

        /// Cap on distinct templates drawn from the catalog
        #[arg(long)]
        template_cap: Option<usize>,

        /// Concurrent provider calls
        #[arg(long)]
        concurrency: Option<usize>,

        /// Output session JSON
        #[arg(long)]
        out: PathBuf,

        /// SQLite sample cache
        #[arg(long)]
        cache: Option<PathBuf>,

        /// JSONL trace output (one event per probe)
        #[arg(long)]
        trace: Option<PathBuf>,
    },
    /// Print the deterministic worklist for a run without calling providers
    Plan {
        #[arg(long)]
        claim: String,

        #[arg(long)]
        slots: Option<usize>,

        #[arg(long)]
        replicates: Option<usize>,

        #[arg(long)]
        template_cap: Option<usize>,
    },
    /// Recompute the confidence interval of a stored session at a larger B
    ///
    /// Replaces only the CI bounds and replica count; the point estimate,
    /// counts, and stored logits are untouched.
    Refine {
        /// Session JSON written by `estimate`
        #[arg(long)]
        session: PathBuf,

        /// New bootstrap replica count
        #[arg(long)]
        bootstrap_replicas: u32,

        /// Output session JSON (defaults to overwriting --session)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export SQLite sample cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite sample cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    request: Option<PathBuf>,
    claim: Option<String>,
    model: Option<String>,
    slots: Option<usize>,
    replicates: Option<usize>,
    bootstrap_replicas: Option<u32>,
    seed: Option<u64>,
    template_cap: Option<usize>,
    concurrency: Option<usize>,
) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = match (request, claim) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<RunConfig>(&raw)?
        }
        (None, Some(claim)) => {
            let model = model
                .clone()
                .ok_or("--model is required with an inline --claim")?;
            RunConfig::new(claim, model)
        }
        (None, None) => return Err("provide --request or --claim".into()),
    };

    if let Some(model) = model {
        config.model = model;
    }
    if let Some(slots) = slots {
        config.paraphrase_slots = slots;
    }
    if let Some(replicates) = replicates {
        config.replicates = replicates;
    }
    if let Some(b) = bootstrap_replicas {
        config.bootstrap_replicas = b;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    if template_cap.is_some() {
        config.template_cap = template_cap;
    }
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Estimate {
            request,
            claim,
            model,
            slots,
            replicates,
            bootstrap_replicas,
            seed,
            template_cap,
            concurrency,
            out,
            cache,
            trace,
        } => {
            let config = build_config(
                request,
                claim,
                model,
                slots,
                replicates,
                bootstrap_replicas,
                seed,
                template_cap,
                concurrency,
            )?;
            config.validate()?;

            let catalog = TemplateCatalog::builtin();
            let gateway = Arc::new(ProviderGateway::from_env()?);
            let mut executor = GatewayExecutor::new(gateway, catalog.clone(), &config);
            if let Some(path) = cache {
                executor = executor.with_cache(Arc::new(SqliteSampleCache::new(path)?));
            }

            let (trace_sink, trace_worker) = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    (Some(sink), Some(worker))
                }
                None => (None, None),
            };
            let trace_ref = trace_sink.as_ref().map(|s| s as &dyn TraceSink);

            eprintln!(
                "[estimate] {} probes ({} slots x {} replicates) against {}...",
                config.paraphrase_slots * config.replicates,
                config.paraphrase_slots,
                config.replicates,
                config.model
            );

            let session =
                estimate_with_options(&executor, &catalog, &config, trace_ref, None).await;

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                let _ = worker.join();
            }

            let session = session?;
            let est = &session.estimate;
            eprintln!(
                "[estimate] p = {:.4}  [{:.4}, {:.4}]  ({}/{} probes ok, compliance {:.0}%)",
                est.probability,
                est.ci_lower,
                est.ci_upper,
                est.totals.succeeded,
                est.totals.planned,
                est.compliance_rate * 100.0
            );
            for warning in &est.warnings {
                eprintln!("[estimate] warning: {warning:?}");
            }

            let json = serde_json::to_string_pretty(&session)?;
            let mut file = File::create(&out)?;
            writeln!(file, "{json}")?;
            eprintln!("[estimate] session written to {}", out.display());
        }
        Commands::Plan {
            claim,
            slots,
            replicates,
            template_cap,
        } => {
            let mut config = RunConfig::new(claim, "planned/none");
            if let Some(slots) = slots {
                config.paraphrase_slots = slots;
            }
            if let Some(replicates) = replicates {
                config.replicates = replicates;
            }
            config.template_cap = template_cap;
            config.validate()?;

            let mut catalog = TemplateCatalog::builtin();
            if let Some(cap) = config.template_cap {
                catalog = catalog.with_cap(cap)?;
            }
            let units = build_worklist(config.paraphrase_slots, config.replicates, &catalog)?;
            for unit in units {
                println!("{}", serde_json::to_string(&unit)?);
            }
        }
        Commands::Refine {
            session,
            bootstrap_replicas,
            out,
        } => {
            let raw = std::fs::read_to_string(&session)?;
            let mut loaded: EstimateSession = serde_json::from_str(&raw)?;

            let previous = (loaded.estimate.ci_lower, loaded.estimate.ci_upper);
            loaded.estimate = loaded.refine_interval(bootstrap_replicas)?;
            eprintln!(
                "[refine] CI [{:.4}, {:.4}] -> [{:.4}, {:.4}] at B = {}",
                previous.0,
                previous.1,
                loaded.estimate.ci_lower,
                loaded.estimate.ci_upper,
                bootstrap_replicas
            );

            let out = out.unwrap_or(session);
            let json = serde_json::to_string_pretty(&loaded)?;
            let mut file = File::create(&out)?;
            writeln!(file, "{json}")?;
            eprintln!("[refine] session written to {}", out.display());
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteSampleCache::default_path);
            let cache = SqliteSampleCache::new(path)?;
            cache.export_jsonl(out).await?;
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteSampleCache::default_path);
            let cache = SqliteSampleCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}
