/// Functions and structs for working with creating command-line arguments

use anyhow::{anyhow, Result};
use crate::config::defs::MINIMAP2_TAG;


pub mod minimap2 {
    use std::path::Path;
    use anyhow::anyhow;
    use tokio::process::Command;
    use crate::config::defs::{MINIMAP2_PRESET, MINIMAP2_TAG};
    use crate::utils::streams::{read_child_output_to_vec, ChildStream};

    pub async fn minimap2_presence_check() -> anyhow::Result<String> {
        let args: Vec<&str> = vec!["--version"];

        let mut child = Command::new(MINIMAP2_TAG)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn: {}. Is minimap2 installed?",  e))?;

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        child.wait().await?;
        let first_line = lines
            .first()
            .ok_or_else(|| anyhow!("No output from minimap2 --version"))?;
        let version = first_line
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("Invalid minimap2 --version output: {}", first_line))?
            .to_string();
        Ok(version)
    }

    /// Arguments to build a `.mmi` index from a FASTA reference.
    pub fn index_args(reference: &Path, index: &Path) -> Vec<String> {
        vec![
            "-x".to_string(),
            MINIMAP2_PRESET.to_string(),
            "-d".to_string(),
            index.to_string_lossy().to_string(),
            reference.to_string_lossy().to_string(),
        ]
    }

    /// Arguments to map FASTA on stdin against an index, PAF to stdout.
    pub fn map_args(index: &Path, threads: usize) -> Vec<String> {
        vec![
            "-x".to_string(),
            MINIMAP2_PRESET.to_string(),
            "-t".to_string(),
            threads.max(1).to_string(),
            "--secondary=no".to_string(),
            index.to_string_lossy().to_string(),
            "-".to_string(),
        ]
    }
}


pub async fn check_version(tool: &str) -> Result<String> {
    let version = match tool {
        MINIMAP2_TAG => minimap2::minimap2_presence_check().await,
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    Ok(version?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_map_args() {
        let args = minimap2::map_args(Path::new("/tmp/x/reference.mmi"), 0);
        assert_eq!(args, vec!["-x", "map-ont", "-t", "1", "--secondary=no", "/tmp/x/reference.mmi", "-"]);
    }

    #[test]
    fn test_index_args() {
        let args = minimap2::index_args(Path::new("ref.fa"), Path::new("out.mmi"));
        assert_eq!(args, vec!["-x", "map-ont", "-d", "out.mmi", "ref.fa"]);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        assert!(check_version("samtools").await.is_err());
    }
}
