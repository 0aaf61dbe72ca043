use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, debug, error, info, LevelFilter};

use haystack_db::cli::{self, parse};
use haystack_db::config::defs::{PipelineError, RunConfig};
use haystack_db::pipelines::db;
use haystack_db::utils::file::resolve_path;
use haystack_db::utils::system::{detect_cores, detect_ram, memory_budget_mb};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Haystack DB\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let max_cores = detect_cores(args.cores);
    debug!("Using {} cores, {} per bowtie2-build", max_cores, args.bowtie2_threads);

    let (total_ram, available_ram) = detect_ram()?;
    debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
    debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
    let memory_budget_mb = memory_budget_mb(args.mem, total_ram);
    info!("Indexing memory budget: {:.0} MB", memory_budget_mb);

    let out_dir = setup_output_dir(&args, &dir)?;
    info!("Writing database to {}", out_dir.display());
    let module = args.module.clone();
    let run_config = Arc::new(RunConfig {
        cwd: dir,
        out_dir,
        args,
        memory_budget_mb,
        max_cores,
    });

    if let Err(e) = match module.as_str() {
        "plan" | "index" => db::run(run_config).await,
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    } {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Sets up output directory
/// If `db_output` is specified from args, uses it;
/// otherwise, creates a directory named `haystack_db_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &cli::Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.db_output {
        Some(out) => resolve_path(Path::new(out), cwd),
        None => {
            let timestamp = chrono::Local::now().format("%Y%m%d").to_string();
            cwd.join(format!("haystack_db_{}", timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
