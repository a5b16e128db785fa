// src/utils/streams.rs: Plumbing between tokio child processes and the pipeline
use std::io;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use crate::utils::fastx::write_fasta_record;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// Spawns `program` with stdin and stdout piped and stderr discarded. The child is killed if
/// its handle is dropped before it exits, so an early return never leaves it running.
pub fn spawn_piped(program: &str, args: &[String]) -> io::Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}


/// Collects the lines of a child's stdout or stderr.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to read.
///
/// # Returns
/// Vec of lines, without terminators.
///
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut lines_out = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout was not piped"))?;
            let mut lines = BufReader::new(out).lines();
            while let Some(line) = lines.next_line().await? {
                lines_out.push(line);
            }
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr was not piped"))?;
            let mut lines = BufReader::new(err).lines();
            while let Some(line) = lines.next_line().await? {
                lines_out.push(line);
            }
        }
    }
    Ok(lines_out)
}


/// Writes (id, sequence) pairs to a child's stdin as FASTA, then closes it.
/// Runs on its own task so the caller can read stdout at the same time.
///
/// # Arguments
///
/// * `stdin` - The child's stdin.
/// * `records` - Query ids and sequences.
///
/// # Returns
/// Handle resolving once stdin is closed.
///
pub fn feed_fasta_to_stdin(mut stdin: ChildStdin, records: Vec<(String, Vec<u8>)>) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut buffer = Vec::with_capacity(records.iter().map(|(id, s)| id.len() + s.len() + 3).sum());
        for (id, seq) in &records {
            write_fasta_record(&mut buffer, id, seq)?;
        }
        stdin.write_all(&buffer).await?;
        stdin.shutdown().await?;
        Ok(())
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_feed_and_read_back() -> Result<()> {
        let mut child = spawn_piped("cat", &[])?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let writer = feed_fasta_to_stdin(stdin, vec![("r1".to_string(), b"ACGT".to_vec())]);

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        writer.await??;
        child.wait().await?;
        assert_eq!(lines, vec![">r1", "ACGT"]);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_child_is_killed() -> Result<()> {
        let child = spawn_piped("sleep", &["30".to_string()])?;
        let pid = child.id().ok_or_else(|| anyhow!("child exited early"))?;
        drop(child);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // either reaped already or a zombie waiting to be
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).unwrap_or_default();
        let state = status.lines().find(|l| l.starts_with("State:")).unwrap_or("");
        assert!(state.is_empty() || state.contains('Z'), "sleep still alive: {}", state);
        Ok(())
    }
}
