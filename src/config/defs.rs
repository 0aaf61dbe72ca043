use std::path::PathBuf;
use crate::cli::Arguments;
use lazy_static::lazy_static;
use std::collections::HashMap;
use thiserror::Error;

// External software
pub const GZIP_EXT: &str = "gz";
pub const BOWTIE2_BUILD_TAG: &str = "bowtie2-build";


lazy_static! {
    pub static ref TOOL_VERSIONS: HashMap<&'static str, f32> = {
        let mut m = HashMap::new();
        m.insert(BOWTIE2_BUILD_TAG, 2.3);

        m
    };
}

// Static Filenames
pub const BOWTIE_DIR: &str = "bowtie";
pub const CHUNK_PLAN_FILE: &str = "chunk_plan.bin";
pub const CHUNK_MEMBERSHIP_FILE: &str = "chunk_membership.tsv";
pub const CHUNK_COUNT_FILE: &str = "chunk_count.txt";
pub const JOIN_MARKER_FILE: &str = "bowtie_index.done";
pub const CHUNK_PREFIX: &str = "chunk";
pub const CHUNK_UNIT_SUFFIX: &str = "fasta.gz";
pub const CHUNK_DONE_SUFFIX: &str = "done";

// Static Parameters
pub const MEGABYTE: f64 = 1_048_576.0;

pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna", "ffn", "frn"];

// Table columns, first alias wins when writing
pub const ORGANISM_COLUMNS: &[&'static str] = &["species", "organism", "taxon"];
pub const ACCESSION_COLUMNS: &[&'static str] = &["accession", "GBSeq_accession-version"];
pub const PATH_COLUMNS: &[&'static str] = &["path", "file"];


/// Failure of a single chunk's index build.
#[derive(Debug, Clone, Error)]
#[error("chunk {chunk_index} failed to build: {cause}")]
pub struct BuildError {
    pub chunk_index: usize,
    pub cause: String,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No reference sequences remain after merging provenances and applying exclusions")]
    EmptyCorpus,

    #[error("Invalid memory budget: {budget_mb} MB with rescale factor {factor}; both must be positive")]
    InvalidBudget { budget_mb: f64, factor: f64 },

    #[error("Conflicting paths for {organism}/{accession}: {existing} vs {incoming}")]
    IdentityConflict {
        organism: String,
        accession: String,
        existing: String,
        incoming: String,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Reference sequence file not found: {0}")]
    MissingSequence(String),

    #[error("Invalid table {path}: {reason}")]
    InvalidTable { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scheduler used out of order: {0}")]
    SchedulerOrder(String),

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}


pub struct RunConfig  {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub memory_budget_mb: f64,
    pub max_cores: usize,
}

impl RunConfig {
    /// Directory holding the chunk plan, chunk units and bowtie2 indices.
    pub fn bowtie_dir(&self) -> PathBuf {
        self.out_dir.join(BOWTIE_DIR)
    }

    /// Number of index builds allowed to run at once.
    pub fn build_concurrency(&self) -> usize {
        (self.max_cores / self.args.bowtie2_threads.max(1)).max(1)
    }
}
