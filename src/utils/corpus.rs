// src/utils/corpus.rs: reference sequence listing, merging and ordering

use std::fs;
use std::path::{Path, PathBuf};

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cli::MergePolicy;
use crate::config::defs::{PipelineError, ACCESSION_COLUMNS, CHUNK_UNIT_SUFFIX, MEGABYTE, ORGANISM_COLUMNS, PATH_COLUMNS};
use crate::utils::file::{fasta_stem, resolve_path};

/// One reference-sequence file. Identity is (organism, accession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRef {
    pub organism: String,
    pub accession: String,
    pub source_path: PathBuf,
    pub byte_size: u64,
}

impl SequenceRef {
    pub fn identity(&self) -> (&str, &str) {
        (&self.organism, &self.accession)
    }

    pub fn size_mb(&self) -> f64 {
        self.byte_size as f64 / MEGABYTE
    }
}

/// Ordered set of references for one pipeline run. There is no mutating API:
/// reordering produces a new `Corpus`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpus {
    refs: Vec<SequenceRef>,
}

impl Corpus {
    pub fn new(refs: Vec<SequenceRef>) -> Self {
        Corpus { refs }
    }

    pub fn refs(&self) -> &[SequenceRef] {
        &self.refs
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.refs.iter().map(|r| r.byte_size).sum()
    }
}

/// Byte size lookup. `None` means the file does not exist; callers decide
/// whether that is fatal.
pub trait SizeProbe {
    fn byte_size(&self, path: &Path) -> Option<u64>;
}

pub struct FsSizeProbe;

impl SizeProbe for FsSizeProbe {
    fn byte_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvenanceKind {
    QueryResults,
    CatalogGenomes,
    CatalogPlasmids,
    CatalogAssemblies,
    UserSequences,
    UserAccessions,
    Directory,
}

impl ProvenanceKind {
    fn requires_path(&self) -> bool {
        matches!(self, ProvenanceKind::UserSequences)
    }
}

/// One enabled source of references: a TSV table, or a directory for
/// `ProvenanceKind::Directory`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub kind: ProvenanceKind,
    pub location: PathBuf,
}

impl Provenance {
    pub fn new(kind: ProvenanceKind, location: impl Into<PathBuf>) -> Self {
        Provenance { kind, location: location.into() }
    }
}

/// Settings shared by every provenance while listing.
pub struct ListingOptions<'a> {
    pub genome_cache: PathBuf,
    pub exclusions: FxHashSet<String>,
    pub merge_policy: MergePolicy,
    pub probe: &'a dyn SizeProbe,
}

/// A listed entry before its size is known.
#[derive(Debug, Clone, PartialEq)]
struct Listing {
    organism: String,
    accession: String,
    path: PathBuf,
}


/// Reads an exclusion list: one accession per line (first tab field).
/// Blank lines, `#` comments and a leading accession header are skipped.
///
/// # Arguments
///
/// * `path` - Exclusion list file.
///
/// # Returns
/// Set of excluded accessions.
pub fn load_exclusions(path: &Path) -> Result<FxHashSet<String>, PipelineError> {
    let text = fs::read_to_string(path)
        .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?;
    let mut excluded = FxHashSet::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let accession = line.split('\t').next().unwrap_or("").trim();
        if ACCESSION_COLUMNS.contains(&accession) {
            continue;
        }
        excluded.insert(accession.to_string());
    }
    debug!("Loaded {} excluded accessions from {}", excluded.len(), path.display());
    Ok(excluded)
}


fn find_column(header: &[&str], aliases: &[&str]) -> Option<usize> {
    header.iter().position(|h| aliases.contains(&h.trim()))
}


/// Parses a provenance table. Relative paths resolve against the table's
/// directory; missing paths resolve into the genome cache.
fn read_table(provenance: &Provenance, genome_cache: &Path) -> Result<Vec<Listing>, PipelineError> {
    let table = &provenance.location;
    let invalid = |reason: String| PipelineError::InvalidTable {
        path: table.display().to_string(),
        reason,
    };
    let text = fs::read_to_string(table)
        .map_err(|e| PipelineError::IOError(format!("{}: {}", table.display(), e)))?;
    let base_dir = table.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let mut lines = text
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'));
    let header: Vec<&str> = match lines.next() {
        Some(h) => h.split('\t').collect(),
        None => return Ok(Vec::new()),
    };
    let organism_col = find_column(&header, ORGANISM_COLUMNS)
        .ok_or_else(|| invalid(format!("missing organism column (one of {:?})", ORGANISM_COLUMNS)))?;
    let accession_col = find_column(&header, ACCESSION_COLUMNS)
        .ok_or_else(|| invalid(format!("missing accession column (one of {:?})", ACCESSION_COLUMNS)))?;
    let path_col = find_column(&header, PATH_COLUMNS);
    if provenance.kind.requires_path() && path_col.is_none() {
        return Err(invalid(format!("missing path column (one of {:?})", PATH_COLUMNS)));
    }

    let mut listings = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split('\t').map(|f| f.trim()).collect();
        let field = |col: usize| fields.get(col).copied().filter(|f| !f.is_empty());
        let organism = field(organism_col)
            .ok_or_else(|| invalid(format!("row {} has no organism", line_no + 2)))?;
        let accession = field(accession_col)
            .ok_or_else(|| invalid(format!("row {} has no accession", line_no + 2)))?;
        let path = match path_col.and_then(field) {
            Some(p) => resolve_path(Path::new(p), &base_dir),
            None if provenance.kind.requires_path() => {
                return Err(invalid(format!("row {} has no path", line_no + 2)));
            }
            None => genome_cache.join(format!("{}.{}", accession, CHUNK_UNIT_SUFFIX)),
        };
        listings.push(Listing {
            organism: organism.to_string(),
            accession: accession.to_string(),
            path,
        });
    }
    Ok(listings)
}


/// Lists `<dir>/<organism>/<accession>.fasta[.gz]`, sorted by organism then
/// file name so the order does not depend on the file system.
fn read_directory(dir: &Path) -> Result<Vec<Listing>, PipelineError> {
    let io_err = |e: std::io::Error| PipelineError::IOError(format!("{}: {}", dir.display(), e));
    let mut organism_dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    organism_dirs.sort();

    let mut listings = Vec::new();
    for organism_dir in organism_dirs {
        let organism = match organism_dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let mut files: Vec<PathBuf> = fs::read_dir(&organism_dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        for path in files {
            if let Some(accession) = fasta_stem(&path) {
                listings.push(Listing { organism: organism.clone(), accession, path });
            }
        }
    }
    Ok(listings)
}


/// Merges every provenance into one corpus, in provenance order then row
/// order.
///
/// # Arguments
///
/// * `provenances` - Enabled sources, in priority order (later wins under `MergePolicy::LastWins`).
/// * `options` - Genome cache, assembly exclusions, merge policy and size probe.
///
/// # Returns
/// Result<Corpus, PipelineError>
pub fn list_corpus(provenances: &[Provenance], options: &ListingOptions) -> Result<Corpus, PipelineError> {
    let mut refs: Vec<SequenceRef> = Vec::new();
    let mut positions: FxHashMap<(String, String), usize> = FxHashMap::default();

    for provenance in provenances {
        let listings = match provenance.kind {
            ProvenanceKind::Directory => read_directory(&provenance.location)?,
            _ => read_table(provenance, &options.genome_cache)?,
        };
        let listed = listings.len();
        let mut excluded = 0usize;

        for listing in listings {
            if provenance.kind == ProvenanceKind::CatalogAssemblies
                && options.exclusions.contains(&listing.accession)
            {
                excluded += 1;
                continue;
            }

            let key = (listing.organism.clone(), listing.accession.clone());
            if let Some(&pos) = positions.get(&key) {
                let existing = &refs[pos];
                if existing.source_path == listing.path {
                    debug!("Duplicate {}/{} with identical path; keeping one", key.0, key.1);
                    continue;
                }
                match options.merge_policy {
                    MergePolicy::Reject => {
                        return Err(PipelineError::IdentityConflict {
                            organism: key.0,
                            accession: key.1,
                            existing: existing.source_path.display().to_string(),
                            incoming: listing.path.display().to_string(),
                        });
                    }
                    MergePolicy::LastWins => {
                        warn!(
                            "{}/{} listed twice; replacing {} with {}",
                            key.0,
                            key.1,
                            existing.source_path.display(),
                            listing.path.display()
                        );
                        refs[pos] = sized(listing, options.probe)?;
                        continue;
                    }
                }
            }
            positions.insert(key, refs.len());
            refs.push(sized(listing, options.probe)?);
        }
        info!(
            "{:?} {}: {} listed, {} excluded",
            provenance.kind,
            provenance.location.display(),
            listed,
            excluded
        );
    }

    if refs.is_empty() && !provenances.is_empty() {
        return Err(PipelineError::EmptyCorpus);
    }
    info!("Corpus holds {} reference sequences", refs.len());
    Ok(Corpus::new(refs))
}

fn sized(listing: Listing, probe: &dyn SizeProbe) -> Result<SequenceRef, PipelineError> {
    let byte_size = probe
        .byte_size(&listing.path)
        .ok_or_else(|| PipelineError::MissingSequence(listing.path.display().to_string()))?;
    Ok(SequenceRef {
        organism: listing.organism,
        accession: listing.accession,
        source_path: listing.path,
        byte_size,
    })
}


/// Deterministically permutes the corpus. The same seed and input order always
/// give the same output order; the input is left untouched.
///
/// # Arguments
///
/// * `corpus` - Listed references.
/// * `seed` - RNG seed.
///
/// # Returns
/// A new, reordered Corpus.
pub fn shuffle(corpus: &Corpus, seed: u64) -> Corpus {
    let mut refs = corpus.refs.clone();
    let mut rng = StdRng::seed_from_u64(seed);
    refs.shuffle(&mut rng);
    Corpus::new(refs)
}
