/// Functions and structs for invoking the external index builder

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info};
use tokio::process::Command;

use crate::config::defs::{BOWTIE2_BUILD_TAG, TOOL_VERSIONS};


/// Builds a searchable index from one concatenated chunk unit.
pub trait IndexBuilder: Send + Sync + 'static {
    fn build(&self, unit: PathBuf, prefix: PathBuf) -> BoxFuture<'static, Result<()>>;

    /// True when a finished index exists at `prefix`.
    fn artifact_exists(&self, prefix: &Path) -> bool;
}


pub mod bowtie2_build {
    use std::path::Path;

    use anyhow::{anyhow, Result};
    use tokio::process::Command;
    use crate::config::defs::BOWTIE2_BUILD_TAG;

    #[derive(Debug, Clone)]
    pub struct Bowtie2BuildConfig {
        pub threads: usize,
        pub large_index: bool,
    }

    pub async fn bowtie2_build_presence_check() -> Result<String> {
        let output = Command::new(BOWTIE2_BUILD_TAG)
            .arg("--version")
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is bowtie2 installed?", BOWTIE2_BUILD_TAG, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("No output from {} --version", BOWTIE2_BUILD_TAG))?;
        // e.g. "/usr/bin/bowtie2-build-s version 2.5.1"
        let version = first_line
            .split_whitespace()
            .last()
            .ok_or_else(|| anyhow!("Invalid {} --version output: {}", BOWTIE2_BUILD_TAG, first_line))?
            .to_string();
        if version.is_empty() {
            return Err(anyhow!("Empty version number in {} --version output: {}", BOWTIE2_BUILD_TAG, first_line));
        }
        Ok(version)
    }

    pub fn arg_generator(config: &Bowtie2BuildConfig, unit: &Path, prefix: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--threads".to_string());
        args_vec.push(config.threads.max(1).to_string());
        if config.large_index {
            args_vec.push("--large-index".to_string());
        }
        args_vec.push(unit.to_string_lossy().to_string());
        args_vec.push(prefix.to_string_lossy().to_string());
        args_vec
    }

    /// bowtie2-build writes `<prefix>.1.bt2`, or `<prefix>.1.bt2l` for large indices.
    pub fn index_files_exist(prefix: &Path) -> bool {
        ["1.bt2", "1.bt2l"].iter().any(|ext| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(".");
            name.push(ext);
            Path::new(&name).exists()
        })
    }
}


/// `bowtie2-build` run once per chunk unit.
#[derive(Debug, Clone)]
pub struct Bowtie2Build {
    pub config: bowtie2_build::Bowtie2BuildConfig,
}

impl Bowtie2Build {
    pub fn new(threads: usize, large_index: bool) -> Self {
        Bowtie2Build {
            config: bowtie2_build::Bowtie2BuildConfig { threads, large_index },
        }
    }
}

impl IndexBuilder for Bowtie2Build {
    fn build(&self, unit: PathBuf, prefix: PathBuf) -> BoxFuture<'static, Result<()>> {
        let args = bowtie2_build::arg_generator(&self.config, &unit, &prefix);
        async move {
            debug!("{} {}", BOWTIE2_BUILD_TAG, args.join(" "));
            let output = Command::new(BOWTIE2_BUILD_TAG)
                .args(&args)
                .stdin(std::process::Stdio::null())
                .output()
                .await
                .map_err(|e| anyhow!("Failed to spawn {}: {}", BOWTIE2_BUILD_TAG, e))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                return Err(anyhow!(
                    "{} exited with {}: {}",
                    BOWTIE2_BUILD_TAG,
                    output.status,
                    tail.join(" | ")
                ));
            }
            Ok(())
        }
        .boxed()
    }

    fn artifact_exists(&self, prefix: &Path) -> bool {
        bowtie2_build::index_files_exist(prefix)
    }
}


pub async fn check_version(tool: &str) -> Result<String> {
    let version = match tool {
        BOWTIE2_BUILD_TAG => bowtie2_build::bowtie2_build_presence_check().await,
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    Ok(version?)
}


/// Checks every tool is installed and at least the version in TOOL_VERSIONS.
pub async fn check_versions(tools: Vec<&str>) -> Result<()> {
    for tool in tools {
        let version = check_version(tool).await?;
        let numeric: String = version
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let major_minor: f32 = numeric
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".")
            .parse()
            .map_err(|_| anyhow!("Cannot parse {} version '{}'", tool, version))?;
        if let Some(&min) = TOOL_VERSIONS.get(tool) {
            if major_minor < min {
                return Err(anyhow!("{} version {} found; {} or newer required", tool, version, min));
            }
        }
        info!("{} version {}", tool, version);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bowtie2_build_args() {
        let config = bowtie2_build::Bowtie2BuildConfig { threads: 4, large_index: true };
        let args = bowtie2_build::arg_generator(&config, Path::new("/db/chunk1.fasta.gz"), Path::new("/db/chunk1"));
        assert_eq!(args, vec!["--threads", "4", "--large-index", "/db/chunk1.fasta.gz", "/db/chunk1"]);

        let config = bowtie2_build::Bowtie2BuildConfig { threads: 0, large_index: false };
        let args = bowtie2_build::arg_generator(&config, Path::new("u"), Path::new("p"));
        assert_eq!(args, vec!["--threads", "1", "u", "p"]);
    }

    #[test]
    fn test_index_files_exist() -> Result<()> {
        let dir = tempdir()?;
        let prefix = dir.path().join("chunk2");
        assert!(!bowtie2_build::index_files_exist(&prefix));
        std::fs::write(dir.path().join("chunk2.1.bt2l"), b"")?;
        assert!(bowtie2_build::index_files_exist(&prefix));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        assert!(check_version("not-a-tool").await.is_err());
    }
}
