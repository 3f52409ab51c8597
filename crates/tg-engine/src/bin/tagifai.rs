//! `tagifai` command line: data preparation, search, training and inspection
//! of published runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tg_data::{
    compute_features_from_files, write_csv, ArtifactCodec, EntityRow, FeatureStore, LocalRunStore,
    OfflineFeatureStore, RemoteClient, RunStore, Settings, TAGS_URL,
};
use tg_engine::{
    ArtifactBundleLoader, BaselineTrainer, BehavioralReevaluator, LogisticFactory, ReleaseSource,
    ReportSource, RunComparator, RunRecorder, RunStoreSource, TrainingObjective, WORKSPACE_TAG,
};
use tg_optimizer::{MedianPruner, RandomSampler, TrialScheduler};
use tg_types::{Device, Params};

#[derive(Parser, Debug)]
#[command(name = "tagifai", version, about = "Text tagging run lifecycle", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download the tag catalogue into the data directory
    DownloadAuxiliaryData,
    /// Join projects with the tag catalogue into training features
    ComputeFeatures {
        #[arg(long)]
        params_fp: Option<PathBuf>,
    },
    /// Search hyperparameters and write the best ones back to the params file
    Optimize {
        #[arg(long)]
        params_fp: Option<PathBuf>,
        #[arg(long, default_value = "optimization")]
        study_name: String,
        #[arg(long, default_value_t = 100)]
        num_trials: usize,
    },
    /// Train with the params file and publish the run
    TrainModel {
        #[arg(long)]
        params_fp: Option<PathBuf>,
        #[arg(long, default_value = "best")]
        experiment_name: String,
        #[arg(long, default_value = "model")]
        run_name: String,
    },
    /// Predict tags for a text with a published run
    PredictTags { text: String, run_id: String },
    /// Show the params of a published run
    Params { run_id: String },
    /// Show the performance report of a published run
    Performance { run_id: String },
    /// Compare params and performance between two release tags
    Diff {
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long, default_value = WORKSPACE_TAG)]
        tag_a: String,
        /// Defaults to the latest release
        #[arg(long)]
        tag_b: Option<String>,
    },
    /// Re-run the behavioral suite against a published run
    BehavioralReevaluation { run_id: String },
    /// Point-in-time feature lookup for a few sample projects
    GetHistoricalFeatures,
    /// Delete an experiment and all of its runs
    DeleteExperiment { name: String },
    /// List experiments in the run store
    Experiments,
}

fn emit<T: Serialize>(label: &str, value: &T) -> anyhow::Result<()> {
    info!("{label}:\n{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_store(settings: &Settings) -> anyhow::Result<Arc<dyn RunStore>> {
    let store = LocalRunStore::open(&settings.tracking_dir)
        .with_context(|| format!("opening run store at {}", settings.tracking_dir.display()))?;
    Ok(Arc::new(store))
}

fn load_params(settings: &Settings, params_fp: Option<PathBuf>) -> anyhow::Result<(PathBuf, Params)> {
    let path = params_fp.unwrap_or_else(|| settings.params_path());
    let params = Params::load(&path)?;
    Ok((path, params))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    settings.ensure_dirs()?;

    match cli.command {
        Commands::DownloadAuxiliaryData => {
            let destination = RemoteClient::new()?
                .download_auxiliary_data(TAGS_URL, &settings.tags_path())
                .await?;
            info!("Saved tag catalogue to {}", destination.display());
        }
        Commands::ComputeFeatures { params_fp } => {
            let (_, params) = load_params(&settings, params_fp)?;
            compute_features_from_files(
                &settings.projects_path(),
                &settings.tags_path(),
                &settings.features_path(),
                params.min_freq,
            )?;
        }
        Commands::Optimize {
            params_fp,
            study_name,
            num_trials,
        } => {
            let (path, params) = load_params(&settings, params_fp)?;
            let trainer = BaselineTrainer::from_features_file(&settings.features_path())?;
            let mut scheduler = TrialScheduler::new(
                run_store(&settings)?,
                MedianPruner::default(),
                Box::new(RandomSampler::new(params.seed)),
            );
            let mut objective = TrainingObjective::new(params.clone(), trainer);
            let best = scheduler.search(&params, &mut objective, num_trials, &study_name)?;
            best.save(&path)?;
            emit("Best params", &best)?;
            info!("Saved best params to {}", path.display());
        }
        Commands::TrainModel {
            params_fp,
            experiment_name,
            run_name,
        } => {
            let (_, params) = load_params(&settings, params_fp)?;
            let mut trainer = BaselineTrainer::from_features_file(&settings.features_path())?;
            let record = RunRecorder::new(run_store(&settings)?).record(
                &experiment_name,
                &run_name,
                &mut trainer,
                &params,
            )?;

            let performance = ArtifactCodec::new().read_performance(&record.artifact_location)?;
            std::fs::write(
                settings.performance_path(),
                serde_json::to_string_pretty(&performance)?,
            )?;
            std::fs::write(settings.config_dir.join("run_id.txt"), &record.run_id)?;
            info!("Run ID: {}", record.run_id);
            emit("Performance", &performance.overall)?;
        }
        Commands::PredictTags { text, run_id } => {
            let loader = ArtifactBundleLoader::new(run_store(&settings)?, Arc::new(LogisticFactory));
            let ctx = loader.load(&run_id, Device::Cpu)?;
            emit("Predictions", &ctx.predict(&[text])?)?;
        }
        Commands::Params { run_id } => {
            let params = RunStoreSource::new(run_store(&settings)?).params(&run_id).await?;
            emit("Params", &params)?;
        }
        Commands::Performance { run_id } => {
            let performance = RunStoreSource::new(run_store(&settings)?)
                .performance(&run_id)
                .await?;
            emit("Performance", &performance)?;
        }
        Commands::Diff {
            author,
            repo,
            tag_a,
            tag_b,
        } => {
            let (author, repo) = settings.release(author.as_deref(), repo.as_deref())?;
            let source = ReleaseSource::new(RemoteClient::new()?, &author, &repo, &settings);
            let tag_b = source.resolve_tag(tag_b.as_deref()).await?;

            let (params, performance) = RunComparator::new(Arc::new(source))
                .diff(&tag_a, &tag_b)
                .await?;
            emit("Params diff", &params.to_json())?;
            emit("Performance diff", &performance.to_json())?;
        }
        Commands::BehavioralReevaluation { run_id } => {
            let loader = ArtifactBundleLoader::new(run_store(&settings)?, Arc::new(LogisticFactory));
            let performance = BehavioralReevaluator::new(loader).reevaluate(&run_id)?;
            emit("Behavioral report", &performance.behavioral)?;
        }
        Commands::GetHistoricalFeatures => {
            let store = OfflineFeatureStore::open(settings.features_path())?;
            let midnight = chrono::Local::now()
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .context("midnight is not representable")?;
            let entities: Vec<EntityRow> = [1, 2, 3]
                .into_iter()
                .map(|id| EntityRow {
                    id,
                    event_timestamp: midnight,
                })
                .collect();
            let rows = store.get_historical_features(&entities)?;
            write_csv(&rows, std::io::stdout().lock())?;
        }
        Commands::DeleteExperiment { name } => {
            run_store(&settings)?.delete_experiment(&name)?;
            info!("Deleted experiment {name}");
        }
        Commands::Experiments => {
            let experiments = run_store(&settings)?.list_experiments()?;
            emit("Experiments", &experiments)?;
        }
    }

    Ok(())
}
