use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{ArgAction, Args, Parser, Subcommand};

use clumpalign::distance::DistanceMetric;
use clumpalign::input::{load_replicates, InputFormat};
use clumpalign::pipeline::{run_pipeline, AlignConfig, CancelToken};
use clumpalign::plot::{write_visualizations, Palette};
use clumpalign::progress::format_time_used;
use clumpalign::report::write_results;
use clumpalign::{Logger, VERSION};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Align replicates within K, detect modes and align modes across K
    Align(AlignArgs),
}

#[derive(Args)]
struct AlignArgs {
    /// Directory holding the replicate membership files
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output directory (replaced if it exists)
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Input format (structure, fastStructure, admixture, generalQ)
    #[arg(short = 'f', long = "format", default_value = "generalQ")]
    pub format: String,
    /// Log file path (default to <output>/output.log)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,

    /// K values to align, e.g. "2,3,4" or "2-6" (default: every K found)
    #[arg(long = "k-range")]
    pub k_range: Option<String>,
    /// Use the representative replicate of each mode across K (false: consensus)
    #[arg(long = "use-rep", default_value_t = true, action = ArgAction::Set)]
    pub use_rep: bool,
    /// Allow several higher-K clusters to merge into one lower-K cluster
    #[arg(long = "merge", default_value_t = false)]
    pub merge: bool,
    /// Default mode detection (Louvain with recursive refinement)
    #[arg(long = "cd-default", default_value_t = true, action = ArgAction::Set)]
    pub cd_default: bool,
    /// Louvain resolution, used when --cd-default is false
    #[arg(long = "cd-res")]
    pub cd_res: Option<f64>,
    /// Seed for the Louvain node visiting order
    #[arg(long = "cd-seed")]
    pub cd_seed: Option<u64>,
    /// Column distance (squared-euclidean, total-variation)
    #[arg(long = "metric", default_value = "squared-euclidean")]
    pub metric: String,
    /// Align modes between every pair of K values, not only adjacent ones
    #[arg(long = "all-pairs", default_value_t = false)]
    pub all_pairs: bool,
    /// Time limit for the across-K optimization in seconds (0 = no limit)
    #[arg(long = "ilp-time-limit", default_value_t = 60.0)]
    pub ilp_time_limit: f64,

    /// Number of parallel threads
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,
    /// Render plots
    #[arg(long = "vis", default_value_t = true, action = ArgAction::Set)]
    pub vis: bool,
    /// Comma separated #rrggbb colours for the clusters
    #[arg(long = "cmap")]
    pub cmap: Option<String>,
}

/// "2,3,4", "2-6" or a mix such as "2-4,6"
fn parse_k_range(spec: &str) -> Result<Vec<usize>, String> {
    let mut ks = Vec::new();
    for part in spec.split(',').map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| format!("Error: invalid K value '{}' in --k-range", s.trim()))
        };
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("Error: K interval {} is reversed", part));
                }
                ks.extend(lo..=hi);
            }
            None => ks.push(parse(part)?),
        }
    }
    if ks.is_empty() {
        return Err("Error: --k-range is empty".to_string());
    }
    Ok(ks)
}

/// Absolute form of a path whose tail may not exist yet
fn resolve_path(path: &Path) -> Result<PathBuf, Box<dyn Error>> {
    if let Ok(resolved) = fs::canonicalize(path) {
        return Ok(resolved);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    while let Some(parent) = existing.parent() {
        if let Some(name) = existing.file_name() {
            tail.push(name.to_os_string());
        }
        existing = parent;
        if let Ok(mut resolved) = fs::canonicalize(existing) {
            for name in tail.iter().rev() {
                resolved.push(name);
            }
            return Ok(resolved);
        }
    }
    Ok(absolute)
}

/// The output directory is replaced, so it must neither be nor contain the input
fn check_output_dir(input: &Path, output: &Path) -> Result<(), Box<dyn Error>> {
    let input_dir = resolve_path(input)?;
    let output_dir = resolve_path(output)?;
    if input_dir == output_dir {
        return Err(format!(
            "Error: input and output directories are the same: {}",
            input_dir.display()
        )
        .into());
    }
    if input_dir.starts_with(&output_dir) {
        return Err(format!(
            "Error: output directory {} contains the input directory {}",
            output_dir.display(),
            input_dir.display()
        )
        .into());
    }
    Ok(())
}

fn validate_align_args(args: &AlignArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: input directory cannot be empty".into());
    }
    if !Path::new(&args.input).is_dir() {
        return Err(format!("Error: input directory does not exist: {}", args.input).into());
    }
    if args.output.trim().is_empty() {
        return Err("Error: output directory cannot be empty".into());
    }
    check_output_dir(Path::new(&args.input), Path::new(&args.output))?;
    args.format.parse::<InputFormat>()?;
    args.metric.parse::<DistanceMetric>()?;
    if let Some(spec) = &args.k_range {
        parse_k_range(spec)?;
    }
    if !(args.ilp_time_limit.is_finite() && args.ilp_time_limit >= 0.0) {
        return Err(format!(
            "Error: --ilp-time-limit must be a non-negative number of seconds (got {})",
            args.ilp_time_limit
        )
        .into());
    }
    if let Some(threads) = args.threads {
        if threads == 0 {
            return Err("Error: number of threads cannot be 0".into());
        }
        if threads > 256 {
            return Err(format!("Error: number of threads cannot exceed 256 (current: {})", threads).into());
        }
    }
    Ok(())
}

fn build_config(args: &AlignArgs) -> Result<AlignConfig, Box<dyn Error>> {
    let k_range = match &args.k_range {
        Some(spec) => Some(parse_k_range(spec)?),
        None => None,
    };
    let config = AlignConfig {
        k_range,
        use_representative: args.use_rep,
        merge_clusters_allowed: args.merge,
        mode_detection_default: args.cd_default,
        mode_detection_resolution: args.cd_res,
        seed: args.cd_seed,
        metric: args.metric.parse::<DistanceMetric>()?,
        all_pairs: args.all_pairs,
        ilp_time_limit: if args.ilp_time_limit > 0.0 {
            Some(Duration::from_secs_f64(args.ilp_time_limit))
        } else {
            None
        },
    };
    config.validate()?;
    Ok(config)
}

fn run_align(args: &AlignArgs) -> Result<(), Box<dyn Error>> {
    let total_start = Instant::now();
    let format = args.format.parse::<InputFormat>()?;
    let config = build_config(args)?;
    check_output_dir(Path::new(&args.input), Path::new(&args.output))?;

    let output = Path::new(&args.output);
    let overwrite = output.exists();
    if overwrite {
        fs::remove_dir_all(output)?;
    }
    fs::create_dir_all(output)?;

    let log_file = match &args.log {
        Some(path) => fs::File::create(path)?,
        None => fs::File::create(output.join("output.log"))?,
    };
    let mut logger = Logger::new(log_file);

    let num_threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    });
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
        .map_err(|e| format!("Error: failed to build thread pool: {}", e))?;

    logger.log("=== clumpalign Align Function Log ===")?;
    logger.log(&format!("Software Version: v{}", VERSION))?;
    logger.log(&format!("Runtime: {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")))?;
    logger.log(&format!("Input Directory: {}", args.input))?;
    logger.log(&format!("Input Format: {}", format.name()))?;
    logger.log(&format!("Output Directory: {}", args.output))?;
    logger.log(&format!("Threads: {}", num_threads))?;
    if overwrite {
        logger.log(&format!("Overwriting existing output directory {}", args.output))?;
    }

    println!("[Align] Processing input data files and checking arguments");
    let load_start = Instant::now();
    let replicates = load_replicates(Path::new(&args.input), format)?;
    logger.log(&format!(
        "Loaded {} replicate(s) of {} individual(s), K values {:?}",
        replicates.total_replicates(),
        replicates.individuals(),
        replicates.k_values()
    ))?;
    println!("{}", format_time_used(load_start.elapsed()));

    let k_max = replicates.k_values().into_iter().max().unwrap_or(0);
    let palette = match &args.cmap {
        Some(spec) => Palette::from_spec(spec, k_max)?,
        None => Palette::default_for(k_max),
    };
    if palette.recycled {
        logger.log("The provided colormap does not have enough colors for all clusters. Colors are recycled.")?;
    }

    let result = match run_pipeline(&replicates, &config, &CancelToken::new(), &mut logger) {
        Ok(result) => result,
        Err(e) => {
            logger.log(&format!("Alignment failed: {}", e))?;
            return Err(e.into());
        }
    };

    println!("[Align] Writing results");
    let write_start = Instant::now();
    write_results(output, &replicates, &result)?;
    if args.vis {
        write_visualizations(output, &result, &palette)?;
    }
    logger.log(&format!("Results written to {}", args.output))?;
    println!("{}", format_time_used(write_start.elapsed()));

    println!("[Align] Total time: {}", format_time_used(total_start.elapsed()));
    logger.log(&format!("Total time: {:.3}s", total_start.elapsed().as_secs_f64()))?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Align(args) => {
            validate_align_args(&args)?;
            run_align(&args)
        }
    }
}
