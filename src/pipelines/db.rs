// src/pipelines/db.rs: chunked reference index database

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fxhash::FxHashSet;
use log::{debug, info, warn};

use crate::cli::Arguments;
use crate::config::defs::{PipelineError, RunConfig, BOWTIE2_BUILD_TAG, MEGABYTE};
use crate::utils::command::{check_versions, Bowtie2Build, IndexBuilder};
use crate::utils::corpus::{self, FsSizeProbe, ListingOptions, Provenance, ProvenanceKind};
use crate::utils::file::resolve_path;
use crate::utils::materialize::ChunkMaterializer;
use crate::utils::partition::{self, ChunkPlan};
use crate::utils::plan_store::{short, PlanStore};
use crate::utils::scheduler::FanOutScheduler;


/// Where a database run stopped.
#[derive(Debug)]
pub enum DbOutcome {
    /// `plan` module: chunk plan and membership tables written.
    Planned(ChunkPlan),
    /// `--dry-run`: tasks planned, nothing built.
    DryRun(ChunkPlan),
    /// Every chunk indexed and the join marker written.
    Indexed { plan: ChunkPlan, join_marker: PathBuf },
}


/// Enabled provenances in merge order, paths resolved against `cwd`.
///
/// # Arguments
///
/// * `args` - Parsed command line.
/// * `cwd` - Directory relative paths are resolved against.
///
/// # Returns
/// Vec<Provenance>
pub fn provenances(args: &Arguments, cwd: &Path) -> Vec<Provenance> {
    let resolve = |p: &String| resolve_path(Path::new(p), cwd);
    let mut out: Vec<Provenance> = args
        .query_results
        .iter()
        .map(|q| Provenance::new(ProvenanceKind::QueryResults, resolve(q)))
        .collect();

    let optional = [
        (ProvenanceKind::CatalogGenomes, &args.refseq_genomes),
        (ProvenanceKind::CatalogPlasmids, &args.refseq_plasmids),
        (ProvenanceKind::CatalogAssemblies, &args.refseq_assemblies),
        (ProvenanceKind::UserSequences, &args.sequences),
        (ProvenanceKind::UserAccessions, &args.accessions),
        (ProvenanceKind::Directory, &args.sequence_dir),
    ];
    for (kind, location) in optional {
        if let Some(location) = location {
            out.push(Provenance::new(kind, resolve(location)));
        }
    }
    out
}


/// Entry point for the `plan` and `index` modules, building with bowtie2-build.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    if config.args.module == "index" && !config.args.dry_run {
        check_versions(vec![BOWTIE2_BUILD_TAG])
            .await
            .map_err(|e| PipelineError::ToolExecution {
                tool: BOWTIE2_BUILD_TAG.to_string(),
                error: e.to_string(),
            })?;
    }
    let builder = Arc::new(Bowtie2Build::new(config.args.bowtie2_threads, config.args.large_index));
    build_database(config, builder).await?;
    Ok(())
}


/// Lists the corpus, partitions it under the memory budget, persists the plan
/// and fans out one index build per chunk.
///
/// # Arguments
///
/// * `config` - Run configuration.
/// * `builder` - Index builder invoked once per chunk unit.
///
/// # Returns
/// Result<DbOutcome, PipelineError>
pub async fn build_database(config: Arc<RunConfig>, builder: Arc<dyn IndexBuilder>) -> Result<DbOutcome, PipelineError> {
    let start = Instant::now();
    let args = &config.args;
    println!("\n-------------\n Reference Index DB\n-------------\n");

    if !args.has_provenance() {
        return Err(PipelineError::InvalidConfig(
            "no reference source given; pass at least one of --query-results, --refseq-*, --sequences, --accessions or --sequence-dir".to_string(),
        ));
    }

    // Listing
    let exclusions = match &args.invalid_assemblies {
        Some(path) => corpus::load_exclusions(&resolve_path(Path::new(path), &config.cwd))?,
        None => FxHashSet::default(),
    };
    if !exclusions.is_empty() && args.refseq_assemblies.is_none() {
        warn!("--invalid-assemblies given without --refseq-assemblies; exclusions have no effect");
    }
    let options = ListingOptions {
        genome_cache: resolve_path(Path::new(&args.genome_cache), &config.cwd),
        exclusions,
        merge_policy: args.merge_policy,
        probe: &FsSizeProbe,
    };
    let listed = corpus::list_corpus(&provenances(args, &config.cwd), &options)?;
    info!(
        "Listed {} reference sequences ({:.1} MB)",
        listed.len(),
        listed.total_bytes() as f64 / MEGABYTE
    );

    let ordered = if args.no_shuffle {
        listed
    } else {
        debug!("Shuffling corpus with seed {}", args.seed);
        corpus::shuffle(&listed, args.seed)
    };

    // Partitioning
    let plan = partition::plan(&ordered, config.memory_budget_mb, args.bowtie2_scaling)?;
    let store = PlanStore::new(config.bowtie_dir())?;
    let plan = store.reconcile(plan)?;
    info!(
        "Chunk plan {}: {} chunk(s), capacity {:.1} MB",
        short(&plan.fingerprint),
        plan.chunk_count,
        plan.capacity_mb
    );

    if args.module == "plan" {
        info!("Plan written to {}", store.dir().display());
        return Ok(DbOutcome::Planned(plan));
    }

    let mut scheduler = FanOutScheduler::new();
    let descriptors = scheduler.plan(&plan)?;
    if args.dry_run {
        for task in &descriptors {
            info!(
                "{}: {} member(s), {:.1} MB -> {}",
                task.id,
                task.chunk.members.len(),
                task.chunk.size_mb(),
                store.index_prefix(task.id.chunk_index).display()
            );
        }
        return Ok(DbOutcome::DryRun(plan));
    }

    // Indexing; the marker is rewritten only from a satisfied join
    store.clear_join_marker()?;
    let materializer = Arc::new(ChunkMaterializer::new(store.clone(), builder));
    let record = scheduler.execute(materializer, config.build_concurrency()).await?;
    let join_marker = store.write_join_marker(&record)?;

    info!(
        "Reference index DB complete: {} chunk(s) in {} ms",
        record.task_ids.len(),
        start.elapsed().as_millis()
    );
    Ok(DbOutcome::Indexed { plan, join_marker })
}
