// src/utils/system.rs: System functions

use anyhow::{anyhow, Result};
use log::warn;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::config::defs::MEGABYTE;


/// Determines number of cores that can be used for concurrent index builds
///
/// # Arguments
///
/// * `args_cores` - Upper bound requested on the command line.
///
/// # Returns
///
/// usize maximum cores
pub fn detect_cores(args_cores: usize) -> usize {
    let physical_cores = System::physical_core_count().unwrap_or(1);
    physical_cores.min(args_cores).max(1)
}


/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<u64, u64> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64)> {
    let (total_ram, available_ram) = if cfg!(target_os = "macos") {
        let refresh_kind = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        let total = system.total_memory();
        let used = system.used_memory();
        (total, total.saturating_sub(used))
    } else {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}


/// Resolves the indexing memory budget in MB: the explicit `--mem` value, or
/// the machine's total memory queried once.
///
/// # Arguments
///
/// * `requested_mb` - Value from the command line, if any.
/// * `total_ram` - Total RAM in bytes from detect_ram.
///
/// # Returns
///
/// f64 budget in MB
pub fn memory_budget_mb(requested_mb: Option<f64>, total_ram: u64) -> f64 {
    let total_mb = total_ram as f64 / MEGABYTE;
    match requested_mb {
        Some(mb) => {
            if mb > total_mb {
                warn!(
                    "Requested memory budget {} MB exceeds total system memory {:.0} MB",
                    mb, total_mb
                );
            }
            mb
        }
        None => total_mb,
    }
}
