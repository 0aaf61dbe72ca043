use clap::{Parser, ValueEnum};

/// How the corpus lister treats one (organism, accession) identity listed by
/// more than one provenance with different source paths.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum MergePolicy {
    #[default]
    Reject,
    LastWins,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "haystack-db", version, about = "Build chunked reference indices for species identification")]
pub struct Arguments {

    #[arg(short, long, default_value = "index", help = "Module to run: 'plan' stops after partitioning, 'index' builds every chunk")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'o', long = "db-output", help = "Output directory for the database. If not specified, a directory named 'haystack_db_YYYYMMDD' will be created in the current working directory.")]
    pub db_output: Option<String>,

    #[arg(short = 'q', long = "query-results", help = "TSV of sequences returned by an NCBI query; may be repeated")]
    pub query_results: Vec<String>,

    #[arg(long = "refseq-genomes")]
    pub refseq_genomes: Option<String>,

    #[arg(long = "refseq-plasmids")]
    pub refseq_plasmids: Option<String>,

    #[arg(long = "refseq-assemblies")]
    pub refseq_assemblies: Option<String>,

    #[arg(long = "invalid-assemblies", help = "Accessions to drop from the RefSeq assemblies table, one per line")]
    pub invalid_assemblies: Option<String>,

    #[arg(short = 's', long = "sequences", help = "TAB DELIMITED file of taxon name, accession and fasta path")]
    pub sequences: Option<String>,

    #[arg(short = 'a', long = "accessions", help = "TAB DELIMITED file of taxon name and accession, resolved in the genome cache")]
    pub accessions: Option<String>,

    #[arg(long = "sequence-dir", help = "Directory laid out as <organism>/<accession>.fasta[.gz]")]
    pub sequence_dir: Option<String>,

    #[arg(long = "genome-cache", default_value = "rip_genomes")]
    pub genome_cache: String,

    #[clap(short = 'S', long, default_value_t = 1, help = "Seed for the randomization of the genomes that each index chunk will include")]
    pub seed: u64,

    #[arg(long, default_value_t = false)]
    pub no_shuffle: bool,

    #[arg(short = 'M', long = "mem", help = "Max memory (MB) allowed for indexing; defaults to total system memory")]
    pub mem: Option<f64>,

    #[arg(long = "bowtie2-scaling", default_value_t = 2.5, help = "Factor to rescale/chunk the input for the multifasta index")]
    pub bowtie2_scaling: f64,

    #[arg(short = 't', long = "bowtie2-threads", default_value_t = 1)]
    pub bowtie2_threads: usize,

    #[arg(long, default_value_t = false)]
    pub large_index: bool,

    #[arg(short = 'c', long, default_value_t = 64)]
    pub cores: usize,

    #[arg(long = "merge-policy", default_value = "reject", value_enum)]
    pub merge_policy: MergePolicy,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

impl Arguments {
    /// True when at least one provenance would contribute sequences.
    pub fn has_provenance(&self) -> bool {
        !self.query_results.is_empty()
            || self.refseq_genomes.is_some()
            || self.refseq_plasmids.is_some()
            || self.refseq_assemblies.is_some()
            || self.sequences.is_some()
            || self.accessions.is_some()
            || self.sequence_dir.is_some()
    }
}
