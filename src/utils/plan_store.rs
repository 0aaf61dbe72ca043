// src/utils/plan_store.rs: persisted chunk plans and per-chunk artifact layout

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::config::defs::{PipelineError, CHUNK_COUNT_FILE, CHUNK_DONE_SUFFIX, CHUNK_MEMBERSHIP_FILE, CHUNK_PLAN_FILE, CHUNK_PREFIX, CHUNK_UNIT_SUFFIX, JOIN_MARKER_FILE};
use crate::utils::file::{remove_if_exists, write_atomic};
use crate::utils::partition::ChunkPlan;
use crate::utils::scheduler::JoinRecord;

/// Owns the on-disk layout of one database's chunk artifacts.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::IOError(format!("{}: {}", path.display(), e))
}

impl PlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(PlanStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn plan_path(&self) -> PathBuf {
        self.dir.join(CHUNK_PLAN_FILE)
    }

    pub fn membership_path(&self) -> PathBuf {
        self.dir.join(CHUNK_MEMBERSHIP_FILE)
    }

    pub fn count_path(&self) -> PathBuf {
        self.dir.join(CHUNK_COUNT_FILE)
    }

    pub fn join_marker_path(&self) -> PathBuf {
        self.dir.join(JOIN_MARKER_FILE)
    }

    /// `chunk{N}.fasta.gz`
    pub fn chunk_unit_path(&self, chunk_index: usize) -> PathBuf {
        self.dir.join(format!("{}{}.{}", CHUNK_PREFIX, chunk_index, CHUNK_UNIT_SUFFIX))
    }

    /// Prefix handed to the index builder, `chunk{N}`.
    pub fn index_prefix(&self, chunk_index: usize) -> PathBuf {
        self.dir.join(format!("{}{}", CHUNK_PREFIX, chunk_index))
    }

    /// `chunk{N}.done`, holding the fingerprint of the plan it was built for.
    pub fn done_marker_path(&self, chunk_index: usize) -> PathBuf {
        self.dir.join(format!("{}{}.{}", CHUNK_PREFIX, chunk_index, CHUNK_DONE_SUFFIX))
    }

    /// Loads the stored plan, if any. An unreadable plan is treated as absent
    /// so the caller re-plans from scratch.
    pub fn load(&self) -> Option<ChunkPlan> {
        let path = self.plan_path();
        let data = fs::read(&path).ok()?;
        match bincode::serde::decode_from_slice::<ChunkPlan, _>(&data, bincode::config::standard()) {
            Ok((plan, _)) => Some(plan),
            Err(e) => {
                warn!("Ignoring unreadable chunk plan {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Returns the plan to execute. A stored plan with the same fingerprint is
    /// reused untouched; otherwise every artifact of the previous generation is
    /// removed and `plan` is written.
    ///
    /// # Arguments
    ///
    /// * `plan` - Freshly computed plan.
    ///
    /// # Returns
    /// Result<ChunkPlan, PipelineError>
    pub fn reconcile(&self, plan: ChunkPlan) -> Result<ChunkPlan, PipelineError> {
        if let Some(stored) = self.load() {
            if stored.fingerprint == plan.fingerprint {
                info!(
                    "Reusing chunk plan {} ({} chunks)",
                    short(&stored.fingerprint),
                    stored.chunk_count
                );
                if !self.membership_path().exists() || !self.count_path().exists() {
                    self.write_tables(&stored)?;
                }
                return Ok(stored);
            }
            info!(
                "Inputs changed since plan {}; re-planning from scratch",
                short(&stored.fingerprint)
            );
        }
        self.invalidate()?;
        self.write(&plan)?;
        Ok(plan)
    }

    /// Removes every per-chunk artifact and the join marker.
    pub fn invalidate(&self) -> Result<(), PipelineError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_chunk_artifact(&name) {
                debug!("Removing stale {}", name);
                let path = entry.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path).map_err(|e| io_error(&path, e))?;
                } else {
                    remove_if_exists(&path).map_err(|e| io_error(&path, e))?;
                }
            }
        }
        self.clear_join_marker()
    }

    fn write(&self, plan: &ChunkPlan) -> Result<(), PipelineError> {
        let path = self.plan_path();
        let encoded = bincode::serde::encode_to_vec(plan, bincode::config::standard())
            .map_err(|e| io_error(&path, e))?;
        write_atomic(&path, &encoded).map_err(|e| io_error(&path, e))?;
        self.write_tables(plan)
    }

    fn write_tables(&self, plan: &ChunkPlan) -> Result<(), PipelineError> {
        let mut table = String::from("chunk\tspecies\taccession\tpath\n");
        for chunk in &plan.chunks {
            for member in &chunk.members {
                let _ = writeln!(
                    table,
                    "{}\t{}\t{}\t{}",
                    chunk.index,
                    member.organism,
                    member.accession,
                    member.source_path.display()
                );
            }
        }
        let membership = self.membership_path();
        write_atomic(&membership, table.as_bytes()).map_err(|e| io_error(&membership, e))?;

        let count = self.count_path();
        write_atomic(&count, format!("{}\n", plan.chunk_count).as_bytes())
            .map_err(|e| io_error(&count, e))?;
        Ok(())
    }

    /// True when chunk `chunk_index` was completed for plan `fingerprint`.
    pub fn is_chunk_done(&self, chunk_index: usize, fingerprint: &str) -> bool {
        fs::read_to_string(self.done_marker_path(chunk_index))
            .map(|s| s.trim() == fingerprint)
            .unwrap_or(false)
    }

    pub fn mark_chunk_done(&self, chunk_index: usize, fingerprint: &str) -> Result<(), PipelineError> {
        let path = self.done_marker_path(chunk_index);
        write_atomic(&path, format!("{}\n", fingerprint).as_bytes()).map_err(|e| io_error(&path, e))
    }

    /// Withdraws the "all indices built" signal before any chunk is rebuilt.
    pub fn clear_join_marker(&self) -> Result<(), PipelineError> {
        let marker = self.join_marker_path();
        remove_if_exists(&marker).map_err(|e| io_error(&marker, e))
    }

    /// Writes the single "all indices built" signal.
    pub fn write_join_marker(&self, record: &JoinRecord) -> Result<PathBuf, PipelineError> {
        let mut body = format!("{}\n", record.fingerprint);
        for id in &record.task_ids {
            let _ = writeln!(body, "{}\t{}", id.chunk_index, self.index_prefix(id.chunk_index).display());
        }
        let path = self.join_marker_path();
        write_atomic(&path, body.as_bytes()).map_err(|e| io_error(&path, e))?;
        Ok(path)
    }
}

pub fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

/// Matches `chunk<digits>` followed by `.` (units, indices, done markers).
fn is_chunk_artifact(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(CHUNK_PREFIX) else {
        return false;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && rest[digits..].starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::corpus::{Corpus, SequenceRef};
    use crate::utils::partition::plan;
    use tempfile::tempdir;

    fn corpus(sizes: &[u64]) -> Corpus {
        Corpus::new(
            sizes
                .iter()
                .enumerate()
                .map(|(i, &mb)| SequenceRef {
                    organism: format!("Org_{}", i),
                    accession: format!("ACC{}", i),
                    source_path: PathBuf::from(format!("/g/{}.fasta.gz", i)),
                    byte_size: mb * 1_048_576,
                })
                .collect(),
        )
    }

    #[test]
    fn test_chunk_artifact_names() {
        assert!(is_chunk_artifact("chunk1.fasta.gz"));
        assert!(is_chunk_artifact("chunk12.rev.1.bt2"));
        assert!(is_chunk_artifact("chunk3.done"));
        assert!(!is_chunk_artifact("chunk_plan.bin"));
        assert!(!is_chunk_artifact("chunk_count.txt"));
        assert!(!is_chunk_artifact("chunk_membership.tsv"));
        assert!(!is_chunk_artifact("chunks"));
    }

    #[test]
    fn test_tables_written() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = PlanStore::new(dir.path().join("bowtie"))?;
        let p = plan(&corpus(&[40, 70, 10]), 100.0, 1.0)?;
        store.reconcile(p)?;

        assert_eq!(fs::read_to_string(store.count_path())?, "2\n");
        let membership = fs::read_to_string(store.membership_path())?;
        let lines: Vec<&str> = membership.lines().collect();
        assert_eq!(lines[0], "chunk\tspecies\taccession\tpath");
        assert_eq!(lines[1], "1\tOrg_0\tACC0\t/g/0.fasta.gz");
        assert_eq!(lines[3], "2\tOrg_2\tACC2\t/g/2.fasta.gz");
        assert_eq!(store.load().map(|p| p.chunk_count), Some(2));
        Ok(())
    }

    #[test]
    fn test_reuse_keeps_chunk_artifacts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = PlanStore::new(dir.path())?;
        let first = store.reconcile(plan(&corpus(&[40, 70, 10]), 100.0, 1.0)?)?;
        store.mark_chunk_done(1, &first.fingerprint)?;
        fs::write(store.index_prefix(1).with_extension("1.bt2"), b"idx")?;

        let second = store.reconcile(plan(&corpus(&[40, 70, 10]), 100.0, 1.0)?)?;
        assert_eq!(first, second);
        assert!(store.is_chunk_done(1, &second.fingerprint));
        assert!(!store.is_chunk_done(2, &second.fingerprint));
        assert!(store.dir().join("chunk1.1.bt2").exists());
        Ok(())
    }

    #[test]
    fn test_changed_inputs_invalidate_previous_generation() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = PlanStore::new(dir.path())?;
        let first = store.reconcile(plan(&corpus(&[40, 70, 10]), 100.0, 1.0)?)?;
        store.mark_chunk_done(1, &first.fingerprint)?;
        store.mark_chunk_done(2, &first.fingerprint)?;
        fs::write(store.chunk_unit_path(2), b"old")?;
        fs::write(store.join_marker_path(), b"old")?;

        let second = store.reconcile(plan(&corpus(&[40, 70, 10]), 30.0, 1.0)?)?;
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(second.chunk_count, 3);
        assert!(!store.done_marker_path(1).exists());
        assert!(!store.chunk_unit_path(2).exists());
        assert!(!store.join_marker_path().exists());
        assert_eq!(fs::read_to_string(store.count_path())?, "3\n");
        Ok(())
    }
}
