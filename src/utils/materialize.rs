// src/utils/materialize.rs: per-chunk concatenation and index build

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use tempfile::NamedTempFile;
use tokio::task;

use crate::utils::command::IndexBuilder;
use crate::utils::file::is_gzipped;
use crate::utils::partition::Chunk;
use crate::utils::plan_store::PlanStore;
use crate::utils::scheduler::{ChunkRunner, IndexArtifact, TaskDescriptor};


/// Concatenates a chunk's members, in order, into one gzip unit. Gzipped
/// members are appended byte-for-byte as extra gzip members; plain members are
/// compressed on the way in.
///
/// # Arguments
///
/// * `chunk` - Chunk to materialize.
/// * `unit_path` - Destination, e.g. `chunk3.fasta.gz`.
///
/// # Returns
/// Result<PathBuf> the written unit.
pub fn materialize(chunk: &Chunk, unit_path: &Path) -> Result<PathBuf> {
    if chunk.members.is_empty() {
        return Err(anyhow!("chunk {} has no members", chunk.index));
    }
    let dir = unit_path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp unit in {}", dir.display()))?;
    let mut writer = BufWriter::new(tmp);

    for member in &chunk.members {
        let path = &member.source_path;
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        if is_gzipped(path)? {
            io::copy(&mut reader, &mut writer)?;
        } else {
            let mut encoder = GzEncoder::new(&mut writer, Compression::fast());
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?;
        }
    }

    let tmp = writer
        .into_inner()
        .map_err(|e| anyhow!("flushing chunk {}: {}", chunk.index, e.error()))?;
    tmp.persist(unit_path)
        .map_err(|e| anyhow!("writing {}: {}", unit_path.display(), e.error))?;
    debug!("chunk {}: {} members -> {}", chunk.index, chunk.members.len(), unit_path.display());
    Ok(unit_path.to_path_buf())
}


/// Materializes each chunk and hands it to the index builder exactly once.
pub struct ChunkMaterializer {
    store: PlanStore,
    builder: Arc<dyn IndexBuilder>,
}

impl ChunkMaterializer {
    pub fn new(store: PlanStore, builder: Arc<dyn IndexBuilder>) -> Self {
        ChunkMaterializer { store, builder }
    }
}

impl ChunkRunner for ChunkMaterializer {
    fn run(&self, task: TaskDescriptor) -> BoxFuture<'static, Result<IndexArtifact>> {
        let store = self.store.clone();
        let builder = self.builder.clone();
        async move {
            let chunk_index = task.id.chunk_index;
            let unit_path = store.chunk_unit_path(chunk_index);
            let prefix = store.index_prefix(chunk_index);

            let chunk = task.chunk;
            let unit = task::spawn_blocking(move || materialize(&chunk, &unit_path)).await??;
            builder.build(unit, prefix.clone()).await?;
            store.mark_chunk_done(chunk_index, &task.id.fingerprint)?;
            Ok(IndexArtifact { chunk_index, prefix })
        }
        .boxed()
    }

    fn is_complete(&self, task: &TaskDescriptor) -> bool {
        let chunk_index = task.id.chunk_index;
        self.store.is_chunk_done(chunk_index, &task.id.fingerprint)
            && self.builder.artifact_exists(&self.store.index_prefix(chunk_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::corpus::SequenceRef;
    use flate2::read::MultiGzDecoder;
    use std::io::{Read, Write};
    use tempfile::tempdir;

    fn member(dir: &Path, name: &str, body: &[u8], gzip: bool) -> Result<SequenceRef> {
        let path = dir.join(name);
        if gzip {
            let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?;
        } else {
            std::fs::write(&path, body)?;
        }
        Ok(SequenceRef {
            organism: "Org".to_string(),
            accession: name.to_string(),
            byte_size: std::fs::metadata(&path)?.len(),
            source_path: path,
        })
    }

    #[test]
    fn test_materialize_preserves_member_order() -> Result<()> {
        let dir = tempdir()?;
        let members = vec![
            member(dir.path(), "b.fasta", b">b\nCCCC\n", false)?,
            member(dir.path(), "a.fasta.gz", b">a\nAAAA\n", true)?,
            member(dir.path(), "c.fasta", b">c\nGGGG\n", false)?,
        ];
        let cumulative_size = members.iter().map(|m| m.byte_size).sum();
        let chunk = Chunk { index: 1, members, cumulative_size };

        let unit = materialize(&chunk, &dir.path().join("chunk1.fasta.gz"))?;
        let mut text = String::new();
        MultiGzDecoder::new(File::open(&unit)?).read_to_string(&mut text)?;
        assert_eq!(text, ">b\nCCCC\n>a\nAAAA\n>c\nGGGG\n");
        Ok(())
    }

    #[test]
    fn test_empty_chunk_is_an_error() {
        let dir = tempdir().unwrap();
        let chunk = Chunk { index: 1, members: Vec::new(), cumulative_size: 0 };
        let err = materialize(&chunk, &dir.path().join("chunk1.fasta.gz")).unwrap_err();
        assert!(err.to_string().contains("no members"));
        assert!(!dir.path().join("chunk1.fasta.gz").exists());
    }

    #[test]
    fn test_missing_member_leaves_no_unit() -> Result<()> {
        let dir = tempdir()?;
        let mut missing = member(dir.path(), "x.fasta", b">x\nA\n", false)?;
        missing.source_path = dir.path().join("gone.fasta");
        let chunk = Chunk { index: 4, members: vec![missing], cumulative_size: 5 };
        assert!(materialize(&chunk, &dir.path().join("chunk4.fasta.gz")).is_err());
        assert!(!dir.path().join("chunk4.fasta.gz").exists());
        Ok(())
    }
}
