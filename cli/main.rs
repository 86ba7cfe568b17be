#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::ArrayView1;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use brainsync::atlas::{AtlasBuild, build_atlas, dist_to_atlas, external_atlas, sync_to_atlas};
use brainsync::io::{
    TextSubjectSource, read_label_mask, read_matrix, write_columns, write_labeled_values,
    write_matrix,
};
use brainsync::stats::covariates::CovariateTable;
use brainsync::stats::regression::regress_nuisance_correlation;
use brainsync::stats::{LabelMask, compare_subject_to_controls, pairwise_regression};
use brainsync::SubjectSource;
use brainsync::types::check_memory_budget;
use brainsync::{AnalysisConfig, AtlasStrategy, CancellationToken, ExecutionContext, SyncError};

mod progress;
use progress::BarProgress;

#[derive(Args)]
struct InputArgs {
    /// Directory holding one tab-separated Time x Vertices file per subject
    #[arg(long, value_name = "DIR")]
    data_dir: PathBuf,

    /// Suffix appended to each subject id to form its file name
    #[arg(long, default_value = ".tsv")]
    extension: String,

    /// Tab-separated covariate table keyed by subject id
    #[arg(long, value_name = "TSV")]
    covariates: PathBuf,

    /// Per-vertex labels; non-positive or NaN labels are excluded from testing
    #[arg(long, value_name = "FILE")]
    mask: Option<PathBuf>,

    /// Analysis configuration (.toml); defaults are used when absent
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Number of worker threads, overriding the configuration (0 = all CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Directory that receives the output files
    #[arg(long, value_name = "DIR")]
    out: PathBuf,
}

#[derive(Args)]
struct AtlasArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Precomputed atlas, required when the configured strategy is External
    #[arg(long, value_name = "FILE")]
    external_atlas: Option<PathBuf>,
}

#[derive(Args)]
struct CompareArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Id of the subject compared against the atlas-flagged controls
    #[arg(long)]
    subject: String,
}

#[derive(Parser)]
#[command(
    name = "brainsync",
    about = "Synchronized fMRI group statistics",
    long_about = "Aligns resting-state fMRI time series across subjects with orthogonal \
                 synchronization and runs vertex-wise group statistics on the aligned data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an atlas, measure every test subject's distance to it and
    /// correlate the distances with the main variable
    Atlas(AtlasArgs),
    /// Permutation test of pairwise synchronized distances against pairwise
    /// differences in the main variable
    Regress(InputArgs),
    /// Compare one subject with the control group vertex by vertex
    Compare(CompareArgs),
    /// Write the default configuration
    InitConfig {
        #[arg(value_name = "TOML")]
        out: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Atlas(args)) => run_atlas(args),
        Some(Commands::Regress(args)) => run_regress(args),
        Some(Commands::Compare(args)) => run_compare(args),
        Some(Commands::InitConfig { out }) => run_init_config(out),
        None => print_help(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_help() -> Result<(), Box<dyn Error>> {
    Cli::command().print_help()?;
    println!();
    Ok(())
}

fn run_init_config(out: PathBuf) -> Result<(), Box<dyn Error>> {
    AnalysisConfig::default().save(&out)?;
    println!("Wrote default configuration to {}", out.display());
    Ok(())
}

/// Everything a subcommand needs once its inputs are parsed.
struct Session {
    config: AnalysisConfig,
    table: CovariateTable,
    pool: brainsync::WorkerPool,
    cancel: CancellationToken,
    progress: BarProgress,
}

impl Session {
    fn open(input: &InputArgs) -> Result<Self, Box<dyn Error>> {
        let mut config = match &input.config {
            Some(path) => AnalysisConfig::load(path)?,
            None => AnalysisConfig::default(),
        };
        if let Some(workers) = input.workers {
            config.parallel.workers = workers;
        }
        config.validate()?;

        let table = CovariateTable::load(&input.covariates, &config.covariates)?;
        let pool = config.worker_pool()?;
        log::info!("Using {} worker threads", pool.workers());
        fs::create_dir_all(&input.out)?;
        Ok(Self {
            config,
            table,
            pool,
            cancel: CancellationToken::new(),
            progress: BarProgress::default(),
        })
    }

    fn ctx(&self) -> ExecutionContext<'_> {
        ExecutionContext::new(&self.pool, &self.cancel, &self.progress)
    }

    fn source(&self, input: &InputArgs, rows: &[usize]) -> Result<TextSubjectSource, SyncError> {
        let ids: Vec<String> = rows.iter().map(|&r| self.table.ids()[r].clone()).collect();
        TextSubjectSource::open(
            &input.data_dir,
            &ids,
            &input.extension,
            self.config.normalization.time_points,
        )
    }
}

fn load_mask(path: Option<&Path>, vertices: usize) -> Result<LabelMask, Box<dyn Error>> {
    let mask = match path {
        Some(path) => read_label_mask(path)?,
        None => LabelMask::all(vertices),
    };
    mask.ensure_vertices(vertices)?;
    Ok(mask)
}

fn run_atlas(args: AtlasArgs) -> Result<(), Box<dyn Error>> {
    let session = Session::open(&args.input)?;
    let out = &args.input.out;
    let budget = session.config.memory_budget();

    let test_rows = session.table.test_rows(session.config.test_all);
    let source = session.source(&args.input, &test_rows)?;
    let (time_points, vertices) = source.dims();

    let build = match (session.config.atlas.strategy, &args.external_atlas) {
        (AtlasStrategy::External, path) => {
            let path = path.as_deref().ok_or(SyncError::MissingExternalAtlas)?;
            println!("Using external atlas {}", path.display());
            external_atlas(read_matrix(path)?.view(), (time_points, vertices))?
        }
        (strategy, ignored) => {
            if let Some(path) = ignored {
                log::warn!(
                    "Ignoring external atlas '{}' because the configured strategy is {:?}",
                    path.display(),
                    strategy
                );
            }
            build_cohort_atlas(&session, &args.input, strategy)?
        }
    };
    write_matrix(&out.join("atlas.tsv"), build.atlas.view())?;
    if let Some(group) = &build.group {
        println!(
            "Group synchronization converged after {} sweeps (error {:.6e} -> {:.6e})",
            group.sweeps, group.initial_error, group.total_error
        );
        let trace = ndarray::Array1::from(group.error_trace.clone());
        let decrease = ndarray::Array1::from(group.cost_decrease.clone());
        write_columns(
            &out.join("group_sync_trace.tsv"),
            &[("error", trace.view()), ("cost_decrease", decrease.view())],
        )?;
    }

    check_memory_budget(test_rows.len(), time_points, vertices, budget)?;
    let synchronized = sync_to_atlas(build.atlas.view(), &source, session.ctx())?;
    let distances = dist_to_atlas(build.atlas.view(), &synchronized)?;
    drop(synchronized);
    write_matrix(&out.join("atlas_distances.tsv"), distances.view())?;

    let tested = session.table.subset(&test_rows)?;
    write_labeled_values(
        &out.join("atlas_distance_subjects.tsv"),
        ("subject", "main"),
        tested
            .ids()
            .iter()
            .cloned()
            .zip(tested.main().iter().copied()),
    )?;

    let mask = load_mask(args.input.mask.as_deref(), vertices)?;
    let correlation = regress_nuisance_correlation(
        distances.view(),
        tested.main().view(),
        tested.nuisance().view(),
        &mask,
    )?;
    write_columns(
        &out.join("atlas_association.tsv"),
        &[
            ("r", correlation.r.view()),
            ("pval", correlation.pval.view()),
            ("pval_fdr", correlation.pval_fdr.view()),
        ],
    )?;
    println!(
        "{} vertices significant before FDR, {} after",
        correlation.significant_raw, correlation.significant_fdr
    );
    Ok(())
}

/// Builds the atlas from the atlas-flagged subjects of the covariate table.
fn build_cohort_atlas(
    session: &Session,
    input: &InputArgs,
    strategy: AtlasStrategy,
) -> Result<AtlasBuild, Box<dyn Error>> {
    let atlas_rows = session.table.atlas_rows();
    println!("Building atlas from {} subjects", atlas_rows.len());
    let cohort = session
        .source(input, &atlas_rows)?
        .load_cohort(session.config.memory_budget())?;
    let build = build_atlas(
        &cohort,
        strategy,
        None,
        &session.config.group_sync,
        session.ctx(),
    )?;
    if let Some(representative) = build.representative {
        println!(
            "Representative subject: {}",
            session.table.ids()[atlas_rows[representative]]
        );
    }
    Ok(build)
}

fn run_regress(input: InputArgs) -> Result<(), Box<dyn Error>> {
    let session = Session::open(&input)?;
    let test_rows = session.table.test_rows(session.config.test_all);
    let tested = session.table.subset(&test_rows)?;
    let source = session.source(&input, &test_rows)?;
    let mask = load_mask(input.mask.as_deref(), source.dims().1)?;
    let covariate: ArrayView1<f64> = tested.main().view();
    let options = &session.config.permutation;

    let field = match source.load_cohort(session.config.memory_budget()) {
        Ok(cohort) => pairwise_regression(&cohort, covariate, &mask, options, session.ctx())?,
        Err(SyncError::MemoryBudgetExceeded { required_bytes, .. }) => {
            log::warn!(
                "Cohort needs {} bytes, above the memory budget; reading subjects per pair",
                required_bytes
            );
            pairwise_regression(&source, covariate, &mask, options, session.ctx())?
        }
        Err(e) => return Err(e.into()),
    };

    let mut columns = vec![
        ("statistic", field.statistic.view()),
        ("pval", field.pval.view()),
        ("pval_fdr", field.pval_fdr.view()),
    ];
    if let Some(pval_max) = &field.pval_max {
        columns.push(("pval_max", pval_max.view()));
    }
    write_columns(&input.out.join("pairwise_association.tsv"), &columns)?;
    println!(
        "Tested {} pairs with {} permutations ({:?})",
        field.n_pairs, field.permutations, field.method
    );
    Ok(())
}

fn run_compare(args: CompareArgs) -> Result<(), Box<dyn Error>> {
    let session = Session::open(&args.input)?;
    let subject_row = session.table.position(&args.subject).ok_or_else(|| {
        format!(
            "Subject '{}' is not in the covariate table or is excluded.",
            args.subject
        )
    })?;
    let control_rows: Vec<usize> = session
        .table
        .atlas_rows()
        .into_iter()
        .filter(|&row| row != subject_row)
        .collect();

    let controls = session.source(&args.input, &control_rows)?;
    let subject = session.source(&args.input, &[subject_row])?;
    let subject = brainsync::SubjectSource::load(&subject, 0)?.into_owned();
    let mask = load_mask(args.input.mask.as_deref(), controls.dims().1)?;

    let comparison = compare_subject_to_controls(
        subject.view(),
        &controls,
        &mask,
        &session.config.compare,
        session.ctx(),
    )?;
    write_columns(
        &args.input.out.join(format!("compare_{}.tsv", args.subject)),
        &[
            ("z", comparison.statistic.view()),
            ("pval", comparison.pval.view()),
            ("pval_fdr", comparison.pval_fdr.view()),
        ],
    )?;
    println!(
        "Compared {} against {} controls ({} control pairs)",
        args.subject,
        control_rows.len(),
        comparison.n_null_pairs
    );
    Ok(())
}
