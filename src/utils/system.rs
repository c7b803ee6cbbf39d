// src/utils/system.rs: System functions

use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;
use sysinfo::{RefreshKind, System};
use tokio::process::Command as TokioCommand;

/// Upper bound on aligner threads chosen automatically.
const MAX_DEFAULT_ALIGN_THREADS: usize = 4;

/// Determines number of physical cores on this host.
///
/// # Returns
///
/// usize physical cores, at least 1
pub fn detect_cores() -> usize {
    let _system = System::new_with_specifics(RefreshKind::nothing().with_cpu(Default::default()));
    System::physical_core_count().unwrap_or(1).max(1)
}

/// Threads handed to each aligner instance.
///
/// # Arguments
///
/// * `requested` - `--n-threads`, if given.
///
/// # Returns
///
/// usize thread count: the request, or the physical core count capped at 4.
pub fn align_threads(requested: Option<usize>) -> usize {
    match requested {
        Some(n) => n.max(1),
        None => {
            let cores = detect_cores();
            let threads = cores.min(MAX_DEFAULT_ALIGN_THREADS);
            debug!("Detected {} physical cores; aligners get {} threads each", cores, threads);
            threads
        }
    }
}

/// Login name of the user running the pipeline, for the default output folder.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Makes every directory under `root` (inclusive) readable and traversable by the group.
pub async fn make_group_readable(root: &Path) -> Result<()> {
    let status = TokioCommand::new("chmod")
        .args(["-R", "g+rX"])
        .arg(root)
        .status()
        .await
        .map_err(|e| anyhow!("Failed to spawn chmod: {}", e))?;
    if !status.success() {
        return Err(anyhow!("chmod -R g+rX {} exited with {}", root.display(), status));
    }
    Ok(())
}
