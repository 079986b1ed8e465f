use crate::metrics;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: u64,
}

/// Usage of the filesystem holding `path`, from `df -B1`.
pub async fn usage(path: &Path) -> anyhow::Result<DiskUsage> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let output = std::process::Command::new("df")
            .arg("-B1")
            .arg(&path)
            .output()?;
        if !output.status.success() {
            anyhow::bail!("df failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        parse_df(&String::from_utf8_lossy(&output.stdout))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
}

fn parse_df(stdout: &str) -> anyhow::Result<DiskUsage> {
    let lines: Vec<&str> = stdout.trim().lines().collect();
    if lines.len() < 2 {
        anyhow::bail!("Unexpected df output");
    }
    let parts: Vec<&str> = lines[1].split_whitespace().collect();
    let total: u64 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let used: u64 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
    let available: u64 = parts.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
    let used_percent = if total > 0 { (used * 100) / total } else { 0 };
    Ok(DiskUsage { total, used, available, used_percent })
}

/// Update the free-space gauge. Failures are logged only.
pub async fn refresh_metric(path: &Path) {
    match usage(path).await {
        Ok(u) => metrics::set_disk_available(u.available),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Disk usage refresh failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df_output() {
        let out = "Filesystem     1B-blocks        Used   Available Use% Mounted on\n\
                   /dev/sda1    100000000000 25000000000 75000000000  25% /\n";
        let usage = parse_df(out).unwrap();
        assert_eq!(usage.available, 75_000_000_000);
        assert_eq!(usage.used_percent, 25);
        assert!(parse_df("garbage").is_err());
    }
}
