//! Child process plumbing. A dump is `stdout -> [encoder] -> file` and a
//! restore is `file -> [decoder] -> stdin`, with stderr drained concurrently
//! so a chatty tool never blocks on a full pipe.

use crate::models::resource::Compression;
use anyhow::Context;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{ChildStderr, Command};

use super::command::program_name;

#[derive(Debug)]
pub struct Captured {
    pub program: String,
    pub status: ExitStatus,
    pub stderr: String,
    /// Uncompressed bytes moved between the file and the process.
    pub bytes: u64,
}

impl Captured {
    /// Raw failure log, or `None` when the process exited cleanly.
    /// `stderr_is_failure` treats any stderr output as a failure.
    pub fn failure_log(&self, stderr_is_failure: bool) -> Option<String> {
        let has_stderr = !self.stderr.trim().is_empty();
        if self.status.success() && !(stderr_is_failure && has_stderr) {
            return None;
        }
        if has_stderr {
            Some(self.stderr.clone())
        } else {
            Some(format!("{} exited with {}", self.program, self.status))
        }
    }
}

/// Run `command`, streaming its stdout through `compression` into `sink`.
pub async fn capture(
    mut command: Command,
    sink: tokio::fs::File,
    compression: Compression,
) -> anyhow::Result<Captured> {
    let program = program_name(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;
    let stderr_task = tokio::spawn(drain(stderr));

    let writer = BufWriter::new(sink);
    let pumped = match compression {
        Compression::None => copy_into(stdout, writer).await,
        Compression::Gzip => copy_into(stdout, GzipEncoder::new(writer)).await,
        Compression::Zstd => copy_into(stdout, ZstdEncoder::new(writer)).await,
    };

    let status = child.wait().await?;
    let stderr = stderr_task.await.map_err(|e| anyhow::anyhow!(e))??;
    let bytes = pumped.with_context(|| format!("Failed to write {program} output"))?;

    Ok(Captured { program, status, stderr, bytes })
}

/// Run `command`, feeding `source` through `compression` into its stdin.
pub async fn feed(
    mut command: Command,
    source: &Path,
    compression: Compression,
) -> anyhow::Result<Captured> {
    let program = program_name(&command);
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("Failed to open {}", source.display()))?;
    let reader = BufReader::new(file);

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    let stdin = child.stdin.take().context("stdin not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;
    let stderr_task = tokio::spawn(drain(stderr));

    let fed = match compression {
        Compression::None => copy_into(reader, stdin).await,
        Compression::Gzip => copy_into(GzipDecoder::new(reader), stdin).await,
        Compression::Zstd => copy_into(ZstdDecoder::new(reader), stdin).await,
    };

    let status = child.wait().await?;
    let stderr = stderr_task.await.map_err(|e| anyhow::anyhow!(e))??;
    // A tool that bails early closes its stdin; its exit status is the real error
    let bytes = match fed {
        Ok(n) => n,
        Err(e) if status.success() => {
            return Err(anyhow::Error::new(e).context(format!("Failed to stream input into {program}")))
        }
        Err(_) => 0,
    };

    Ok(Captured { program, status, stderr, bytes })
}

async fn copy_into<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

async fn drain(mut stderr: ChildStderr) -> std::io::Result<String> {
    let mut buf = Vec::new();
    stderr.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Size in bytes and hex SHA-256 of a file.
pub async fn digest_file(path: &Path) -> anyhow::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}
