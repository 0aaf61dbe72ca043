// src/utils/partition.rs: memory-bounded chunk planning

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::defs::PipelineError;
use crate::utils::corpus::{Corpus, SequenceRef};

/// A contiguous run of the corpus indexed by one build task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// 1-based.
    pub index: usize,
    pub members: Vec<SequenceRef>,
    /// Sum of member byte sizes.
    pub cumulative_size: u64,
}

impl Chunk {
    fn new(index: usize) -> Self {
        Chunk { index, members: Vec::new(), cumulative_size: 0 }
    }

    pub fn size_mb(&self) -> f64 {
        self.members.iter().map(|m| m.size_mb()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub chunk_count: usize,
    pub capacity_mb: f64,
    pub memory_budget_mb: f64,
    pub rescale_factor: f64,
    /// BLAKE3 over the ordered corpus and the sizing parameters.
    pub fingerprint: String,
}

impl ChunkPlan {
    pub fn members(&self) -> impl Iterator<Item = &SequenceRef> {
        self.chunks.iter().flat_map(|c| c.members.iter())
    }
}


/// Digest identifying a plan generation. Any change in corpus order,
/// membership, sizes, budget or factor changes it.
pub fn plan_fingerprint(corpus: &Corpus, memory_budget_mb: f64, rescale_factor: f64) -> String {
    let mut hasher = blake3::Hasher::new();
    for r in corpus.refs() {
        hasher.update(r.organism.as_bytes());
        hasher.update(b"\t");
        hasher.update(r.accession.as_bytes());
        hasher.update(b"\t");
        hasher.update(r.source_path.to_string_lossy().as_bytes());
        hasher.update(b"\t");
        hasher.update(&r.byte_size.to_le_bytes());
        hasher.update(b"\n");
    }
    hasher.update(&memory_budget_mb.to_bits().to_le_bytes());
    hasher.update(&rescale_factor.to_bits().to_le_bytes());
    hasher.finalize().to_hex().to_string()
}


/// Splits the corpus into chunks by prefix-sum bucketing.
///
/// `capacity = memory_budget_mb / rescale_factor`. Walking the corpus in
/// order, each reference lands in bucket `floor(running_total_mb / capacity) + 1`;
/// whenever the bucket differs from the previous reference's, a new chunk
/// starts. Chunks are numbered densely from 1 and nothing is ever moved
/// backwards. Only a chunk's first member can cross a bucket boundary; the
/// members after it sum to less than the capacity. Files following an
/// oversized one share its bucket until the running total leaves it.
///
/// # Arguments
///
/// * `corpus` - Ordered (possibly shuffled) references.
/// * `memory_budget_mb` - Memory available to one index build.
/// * `rescale_factor` - Tool-specific memory multiplier.
///
/// # Returns
/// Result<ChunkPlan, PipelineError>; an empty corpus gives one empty chunk.
pub fn plan(corpus: &Corpus, memory_budget_mb: f64, rescale_factor: f64) -> Result<ChunkPlan, PipelineError> {
    let valid = |v: f64| v.is_finite() && v > 0.0;
    if !valid(memory_budget_mb) || !valid(rescale_factor) {
        return Err(PipelineError::InvalidBudget {
            budget_mb: memory_budget_mb,
            factor: rescale_factor,
        });
    }
    let capacity_mb = memory_budget_mb / rescale_factor;

    let mut chunks = vec![Chunk::new(1)];
    let mut running_total_mb = 0.0f64;
    let mut previous_bucket: Option<u64> = None;

    for r in corpus.refs() {
        running_total_mb += r.size_mb();
        let bucket = (running_total_mb / capacity_mb).floor() as u64 + 1;
        if previous_bucket.is_some_and(|prev| prev != bucket) {
            let next = chunks.len() + 1;
            chunks.push(Chunk::new(next));
        }
        previous_bucket = Some(bucket);

        if let Some(chunk) = chunks.last_mut() {
            chunk.cumulative_size += r.byte_size;
            chunk.members.push(r.clone());
        }
    }

    for chunk in &chunks {
        debug!(
            "chunk {}: {} members, {:.1} MB",
            chunk.index,
            chunk.members.len(),
            chunk.size_mb()
        );
    }
    let chunk_count = chunks.len();
    info!(
        "Planned {} chunk(s) for {} sequences (budget {} MB / factor {} = capacity {:.1} MB)",
        chunk_count,
        corpus.len(),
        memory_budget_mb,
        rescale_factor,
        capacity_mb
    );

    Ok(ChunkPlan {
        chunks,
        chunk_count,
        capacity_mb,
        memory_budget_mb,
        rescale_factor,
        fingerprint: plan_fingerprint(corpus, memory_budget_mb, rescale_factor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MB: u64 = 1_048_576;

    fn corpus_mb(sizes: &[u64]) -> Corpus {
        Corpus::new(
            sizes
                .iter()
                .enumerate()
                .map(|(i, &mb)| SequenceRef {
                    organism: format!("Org_{}", i + 1),
                    accession: format!("ACC{}", i + 1),
                    source_path: PathBuf::from(format!("/genomes/file{}.fasta.gz", i + 1)),
                    byte_size: mb * MB,
                })
                .collect(),
        )
    }

    fn member_names(chunk: &Chunk) -> Vec<&str> {
        chunk.members.iter().map(|m| m.accession.as_str()).collect()
    }

    #[test]
    fn test_threshold_crossing() -> anyhow::Result<()> {
        let plan = plan(&corpus_mb(&[40, 70, 10]), 100.0, 1.0)?;
        assert_eq!(plan.chunk_count, 2);
        assert_eq!(member_names(&plan.chunks[0]), vec!["ACC1"]);
        assert_eq!(member_names(&plan.chunks[1]), vec!["ACC2", "ACC3"]);
        assert_eq!(plan.chunks[1].cumulative_size, 80 * MB);
        assert_eq!(plan.chunks[1].index, 2);
        Ok(())
    }

    #[test]
    fn test_empty_corpus_gives_one_empty_chunk() -> anyhow::Result<()> {
        let plan = plan(&Corpus::default(), 100.0, 2.5)?;
        assert_eq!(plan.chunk_count, 1);
        assert_eq!(plan.chunks.len(), 1);
        assert!(plan.chunks[0].members.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_budget() {
        let corpus = corpus_mb(&[1]);
        for (budget, factor) in [(0.0, 1.0), (-5.0, 1.0), (100.0, 0.0), (100.0, -1.0), (f64::NAN, 1.0)] {
            assert!(
                matches!(plan(&corpus, budget, factor), Err(PipelineError::InvalidBudget { .. })),
                "budget {} factor {} should be rejected",
                budget,
                factor
            );
        }
    }

    #[test]
    fn test_oversized_file_is_not_split() -> anyhow::Result<()> {
        let plan = plan(&corpus_mb(&[500]), 100.0, 1.0)?;
        assert_eq!(plan.chunk_count, 1);
        assert_eq!(member_names(&plan.chunks[0]), vec!["ACC1"]);

        // totals 10, 510, 530, 560: buckets 1, 6, 6, 6
        let plan = super::plan(&corpus_mb(&[10, 500, 20, 30]), 100.0, 1.0)?;
        assert_eq!(plan.chunk_count, 2);
        assert_eq!(member_names(&plan.chunks[0]), vec!["ACC1"]);
        assert_eq!(member_names(&plan.chunks[1]), vec!["ACC2", "ACC3", "ACC4"]);

        // totals 10, 510, 600: the third file opens bucket 7
        let plan = super::plan(&corpus_mb(&[10, 500, 90]), 100.0, 1.0)?;
        assert_eq!(plan.chunk_count, 3);
        assert_eq!(member_names(&plan.chunks[1]), vec!["ACC2"]);
        assert_eq!(member_names(&plan.chunks[2]), vec!["ACC3"]);
        Ok(())
    }

    #[test]
    fn test_rescale_factor_shrinks_capacity() -> anyhow::Result<()> {
        let corpus = corpus_mb(&[30, 30, 30, 30]);
        assert_eq!(plan(&corpus, 250.0, 1.0)?.chunk_count, 1);
        // capacity 100: totals 30, 60, 90, 120
        assert_eq!(plan(&corpus, 250.0, 2.5)?.chunk_count, 2);
        Ok(())
    }

    #[test]
    fn test_partition_properties() -> anyhow::Result<()> {
        let sizes: Vec<u64> = (0..200u64).map(|i| (i * 37 + 11) % 97 + 1).collect();
        let corpus = corpus_mb(&sizes);
        for &(budget, factor) in &[(100.0, 1.0), (64.0, 2.5), (1000.0, 3.0), (5.0, 1.0)] {
            let plan = plan(&corpus, budget, factor)?;
            let capacity = budget / factor;

            // reconstructs the corpus exactly
            let flattened: Vec<SequenceRef> = plan.members().cloned().collect();
            assert_eq!(flattened, corpus.refs().to_vec());
            assert_eq!(plan.chunk_count, plan.chunks.len());
            assert!(plan.chunk_count >= 1);

            for (i, chunk) in plan.chunks.iter().enumerate() {
                assert_eq!(chunk.index, i + 1);
                assert!(!chunk.members.is_empty());
                let sum: u64 = chunk.members.iter().map(|m| m.byte_size).sum();
                assert_eq!(sum, chunk.cumulative_size);
                // only the first member may straddle a threshold
                let tail_mb: f64 = chunk.members[1..].iter().map(|m| m.size_mb()).sum();
                assert!(tail_mb < capacity, "chunk {} tail {} >= {}", chunk.index, tail_mb, capacity);
                if chunk.size_mb() > capacity && chunk.members.len() == 1 {
                    assert!(chunk.members[0].size_mb() > capacity);
                }
            }

            let again = super::plan(&corpus, budget, factor)?;
            assert_eq!(plan, again);
        }
        Ok(())
    }

    #[test]
    fn test_fingerprint_tracks_inputs() {
        let corpus = corpus_mb(&[10, 20, 30]);
        let base = plan_fingerprint(&corpus, 100.0, 1.0);
        assert_eq!(base, plan_fingerprint(&corpus, 100.0, 1.0));
        assert_ne!(base, plan_fingerprint(&corpus, 100.0, 2.0));
        assert_ne!(base, plan_fingerprint(&corpus, 90.0, 1.0));
        assert_ne!(base, plan_fingerprint(&corpus_mb(&[10, 20, 31]), 100.0, 1.0));
        let reordered = Corpus::new(corpus.refs().iter().rev().cloned().collect());
        assert_ne!(base, plan_fingerprint(&reordered, 100.0, 1.0));
    }
}
