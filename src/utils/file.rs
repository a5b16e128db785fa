// src/utils/file.rs: File helpers and the polling folder scanner used in watch mode
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use fxhash::FxHashMap as HashMap;
use log::debug;

use crate::config::defs::{FASTQ_EXTS, GZIP_EXT};


pub fn is_gzipped<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Plain or gzip-decoded file contents.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(GzDecoder<File>),
}

impl FileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let gz = is_gzipped(&path)?;
        let file = File::open(&path)?;
        Ok(if gz {
            FileReader::Gzipped(GzDecoder::new(file))
        } else {
            FileReader::Uncompressed(BufReader::new(file))
        })
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}


/// Splits a file name into its stem and extensions.
/// `reads.fastq.gz` gives (`reads`, ["fastq", "gz"]).
pub fn extension_remover(path: &Path) -> (PathBuf, Vec<String>) {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut parts = file_name.split('.');
    let stem = parts.next().unwrap_or_default().to_string();
    let extensions: Vec<String> = parts.map(String::from).collect();
    (path.with_file_name(stem), extensions)
}


pub fn is_fastq_path(path: &Path) -> bool {
    let (_, extensions) = extension_remover(path);
    let mut exts = extensions.iter().rev();
    let last = match exts.next() {
        Some(e) if e.eq_ignore_ascii_case(GZIP_EXT) => exts.next(),
        other => other,
    };
    last.is_some_and(|e| FASTQ_EXTS.iter().any(|f| f.eq_ignore_ascii_case(e)))
}


#[derive(Debug, Clone, Copy)]
struct WatchedFile {
    modified: SystemTime,
    consumed: usize,
}

/// Remembers FASTQ files under a folder by modification time and how many of their
/// records have already been read, so a file that grows is only read from where it left off.
#[derive(Debug)]
pub struct FolderScanner {
    root: PathBuf,
    seen: HashMap<PathBuf, WatchedFile>,
}

impl FolderScanner {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FolderScanner {
            root: root.as_ref().to_path_buf(),
            seen: HashMap::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the folder and returns FASTQ files that are new or modified since the last scan,
    /// oldest first, each with the number of records already consumed.
    pub fn scan(&mut self) -> io::Result<Vec<(PathBuf, usize)>> {
        let mut found = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() && is_fastq_path(&path) {
                    let modified = entry.metadata()?.modified()?;
                    match self.seen.get_mut(&path) {
                        Some(watched) if watched.modified == modified => {}
                        Some(watched) => {
                            watched.modified = modified;
                            found.push((modified, path, watched.consumed));
                        }
                        None => {
                            self.seen.insert(path.clone(), WatchedFile { modified, consumed: 0 });
                            found.push((modified, path, 0));
                        }
                    }
                }
            }
        }

        found.sort();
        debug!("Found {} new or modified files under {}", found.len(), self.root.display());
        Ok(found.into_iter().map(|(_, path, consumed)| (path, consumed)).collect())
    }

    /// Records how many records of each file have been read.
    pub fn mark_consumed<I: IntoIterator<Item = (PathBuf, usize)>>(&mut self, progress: I) {
        for (path, consumed) in progress {
            if let Some(watched) = self.seen.get_mut(&path) {
                watched.consumed = consumed;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;
    use crate::utils::fastx::read_sequences;

    #[test]
    fn test_extension_remover() {
        let (stem, exts) = extension_remover(Path::new("/data/reads.fastq.gz"));
        assert_eq!(stem, PathBuf::from("/data/reads"));
        assert_eq!(exts, vec!["fastq".to_string(), "gz".to_string()]);
    }

    #[test]
    fn test_is_fastq_path() {
        assert!(is_fastq_path(Path::new("a.fastq")));
        assert!(is_fastq_path(Path::new("a.fq.gz")));
        assert!(!is_fastq_path(Path::new("a.fasta")));
        assert!(!is_fastq_path(Path::new("a.gz")));
        assert!(!is_fastq_path(Path::new("fastq")));
    }

    #[test]
    fn test_is_gzipped() -> io::Result<()> {
        let dir = tempdir()?;
        let plain = dir.path().join("plain.fastq");
        fs::write(&plain, b"@r\nA\n+\nI\n")?;
        assert!(!is_gzipped(&plain)?);

        let gz = dir.path().join("reads.fastq.gz");
        let mut enc = flate2::write::GzEncoder::new(File::create(&gz)?, flate2::Compression::default());
        enc.write_all(b"@r\nA\n+\nI\n")?;
        enc.finish()?;
        assert!(is_gzipped(&gz)?);

        let empty = dir.path().join("empty.fastq");
        fs::write(&empty, b"")?;
        assert!(!is_gzipped(&empty)?);
        Ok(())
    }

    #[test]
    fn test_scanner_reports_new_and_modified() -> io::Result<()> {
        let dir = tempdir()?;
        let nested = dir.path().join("pass");
        fs::create_dir(&nested)?;
        let a = nested.join("a.fastq");
        fs::write(&a, b"@r\nA\n+\nI\n")?;
        fs::write(dir.path().join("notes.txt"), b"x")?;

        let mut scanner = FolderScanner::new(dir.path());
        assert_eq!(scanner.scan()?, vec![(a.clone(), 0)]);
        assert!(scanner.scan()?.is_empty());

        let file = File::options().append(true).open(&a)?;
        file.set_modified(SystemTime::now() + Duration::from_secs(5))?;
        assert_eq!(scanner.scan()?, vec![(a, 0)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_appended_file_only_yields_new_records() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("reads.fastq");
        fs::write(&path, b"@r1 ch=1\nACGT\n+\nIIII\n")?;
        let mut scanner = FolderScanner::new(dir.path());

        let mut ids = Vec::new();
        for round in 0..2u64 {
            if round == 1 {
                let mut file = File::options().append(true).open(&path)?;
                file.write_all(b"@r2 ch=2\nGGCC\n+\nIIII\n")?;
                file.set_modified(SystemTime::now() + Duration::from_secs(5))?;
            }
            let (mut rx, progress) = read_sequences(scanner.scan()?, 4);
            let mut batch = Vec::new();
            while let Some(record) = rx.recv().await {
                batch.push(record.id().to_string());
            }
            scanner.mark_consumed(progress.await?);
            ids.push(batch);
        }
        assert_eq!(ids, vec![vec!["r1".to_string()], vec!["r2".to_string()]]);

        // nothing new since
        assert!(scanner.scan()?.is_empty());
        Ok(())
    }
}
