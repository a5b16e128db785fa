use seq_io::fasta::{Reader as FastaReader, OwnedRecord as FastaOwnedRecord};
use seq_io::fastq::{Reader as FastqReader, OwnedRecord as FastqOwnedRecord};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::config::defs::{FASTA_EXTS, FASTQ_EXTS};
use crate::utils::file::{extension_remover, FileReader};

const FASTA_TAG : &str = "fasta";
const FASTQ_TAG : &str = "fastq";

/// Defines FASTA and FASTQ as part of a unified FASTX structure.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceRecord {
    Fasta {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
    },
    Fastq {
        id: String,
        desc: Option<String>,
        seq: Vec<u8>,
        qual: Vec<u8>,
    },
}

/// Maps id and seq to the correct file type.
impl SequenceRecord {
    pub fn id(&self) -> &str {
        match self {
            SequenceRecord::Fasta { id, .. } => id,
            SequenceRecord::Fastq { id, .. } => id,
        }
    }

    pub fn desc(&self) -> Option<&str> {
        match self {
            SequenceRecord::Fasta { desc, .. } => desc.as_deref(),
            SequenceRecord::Fastq { desc, .. } => desc.as_deref(),
        }
    }

    pub fn seq(&self) -> &[u8] {
        match self {
            SequenceRecord::Fasta { seq, .. } => seq,
            SequenceRecord::Fastq { seq, .. } => seq,
        }
    }

    /// Channel from the `ch=` token of the description, as written by the instrument.
    pub fn channel(&self) -> Option<u32> {
        self.desc().and_then(|d| header_value(d, "ch"))
    }

    pub fn read_number(&self) -> Option<u32> {
        self.desc().and_then(|d| header_value(d, "read"))
    }
}

impl From<FastaOwnedRecord> for SequenceRecord {
    fn from(record: FastaOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '>');
        SequenceRecord::Fasta {
            id,
            desc,
            seq: record.seq,
        }
    }
}

impl From<FastqOwnedRecord> for SequenceRecord {
    fn from(record: FastqOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '@');
        SequenceRecord::Fastq {
            id,
            desc,
            seq: record.seq,
            qual: record.qual,
        }
    }
}


/// Looks up `key=value` among whitespace separated description tokens.
fn header_value(desc: &str, key: &str) -> Option<u32> {
    desc.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.parse().ok())
}


/// Enum to hold either FASTA or FASTQ reader
pub enum SequenceReader {
    Fasta(FastaReader<FileReader>),
    Fastq(FastqReader<FileReader>),
}

/// Creates a SequenceReader for either FASTA or FASTQ files, gzipped or not.
///
///
/// # Arguments
///
/// * `path` - Valid path to a fastx file.
///
/// # Returns
/// io::Result<SequenceReader>: Result bearing the correct SequenceReader.
///
pub fn sequence_reader(path: &Path) -> io::Result<SequenceReader> {
    let reader = FileReader::open(path)?;

    match fastx_filetype(path)? {
        FASTA_TAG => Ok(SequenceReader::Fasta(FastaReader::new(reader))),
        FASTQ_TAG => Ok(SequenceReader::Fastq(FastqReader::new(reader))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported file type for path: {:?}", path),
        )),
    }
}


pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    seq: &[u8],
) -> io::Result<()> {
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n")?;
    Ok(())
}


/// Determines if a file path is a FASTA, FASTQ, or neither.
/// Checks extensions, not the body.
///
/// # Arguments
///
/// * `path` - Path of a FASTX file.
///
/// # Returns
/// io::Result<&str>. Ok fastq or fasta, or err.
///
fn fastx_filetype(path: &Path) -> io::Result<&'static str> {
    let (_, extensions) = extension_remover(path);

    for ext in &extensions {
        if FASTA_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)) {
            return Ok(FASTA_TAG);
        }

        if FASTQ_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)) {
            return Ok(FASTQ_TAG);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "File '{}' has invalid extension(s) '{:?}'. Expected FASTA ({:?}) or FASTQ ({:?}).",
            path.display(),
            extensions,
            FASTA_EXTS,
            FASTQ_EXTS
        ),
    ))
}


/// Parses a FASTX header.
///
///
/// # Arguments
///
/// * `head` - Header line of a FASTX record.
/// * 'prefix' - Leading, defining character of the header. > for FASTA, @ for FASTQ.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
///
fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let mut parts = head_str.splitn(2, |c: char| c.is_whitespace());
    let id = parts.next().unwrap_or_default().trim_start_matches(prefix).to_string();
    let desc = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    (id, desc)
}


/// Reads every record of a FASTA or FASTQ file.
pub fn read_records(path: &Path) -> io::Result<Vec<SequenceRecord>> {
    let mut records = Vec::new();
    match sequence_reader(path)? {
        SequenceReader::Fasta(mut reader) => {
            for result in reader.records() {
                records.push(result.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?.into());
            }
        }
        SequenceReader::Fastq(mut reader) => {
            for result in reader.records() {
                records.push(result.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?.into());
            }
        }
    }
    Ok(records)
}


/// Name and length of every sequence in a FASTA file.
pub fn contig_lengths(path: &Path) -> io::Result<Vec<(String, u64)>> {
    Ok(read_records(path)?
        .into_iter()
        .map(|r| (r.id().to_string(), r.seq().len() as u64))
        .collect())
}


/// Asynchronously streams the records of several files, in order, each from a record offset.
/// Unreadable files are logged and skipped; a truncated file yields the records before the error.
///
/// # Arguments
///
/// * `files` - FASTA or FASTQ files, optionally gzipped, each with the number of leading
///   records to skip.
/// * `buffer` - Channel capacity.
///
/// # Returns
/// Receiver of SequenceRecords, closed after the last file, and a handle resolving to the
/// number of complete records found in each file that was read.
///
pub fn read_sequences(
    files: Vec<(PathBuf, usize)>,
    buffer: usize,
) -> (mpsc::Receiver<SequenceRecord>, JoinHandle<Vec<(PathBuf, usize)>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    let progress = tokio::task::spawn_blocking(move || {
        let mut progress = Vec::with_capacity(files.len());
        for (path, skip) in files {
            let reader = match sequence_reader(&path) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let (parsed, open) = match reader {
                SequenceReader::Fastq(mut reader) => forward(reader.records(), &tx, &path, skip),
                SequenceReader::Fasta(mut reader) => forward(reader.records(), &tx, &path, skip),
            };
            if parsed < skip {
                warn!("{} shrank from {} to {} records", path.display(), skip, parsed);
            }
            progress.push((path, parsed.max(skip)));
            if !open {
                break;
            }
        }
        progress
    });

    (rx, progress)
}

/// Sends every record after the first `skip`.
///
/// # Returns
/// (records parsed including skipped ones, receiver still open)
fn forward<I, R, E>(records: I, tx: &mpsc::Sender<SequenceRecord>, path: &Path, skip: usize) -> (usize, bool)
where
    I: Iterator<Item = Result<R, E>>,
    R: Into<SequenceRecord>,
    E: std::fmt::Display,
{
    let mut parsed = 0;
    for result in records {
        match result {
            Ok(record) => {
                parsed += 1;
                if parsed <= skip {
                    continue;
                }
                if tx.blocking_send(record.into()).is_err() {
                    return (parsed, false);
                }
            }
            Err(e) => {
                // a file still being written ends mid-record
                debug!("Stopped reading {} after {} records: {}", path.display(), parsed, e);
                break;
            }
        }
    }
    (parsed, true)
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use tempfile::tempdir;

    const FASTQ: &str = "@read1 runid=abc read=12 ch=7 start_time=x\nACGT\n+\nIIII\n@read2 ch=300\nGGCC\n+\nIIII\n";

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header(b"@r1 ch=3 read=9", '@'), ("r1".to_string(), Some("ch=3 read=9".to_string())));
        assert_eq!(parse_header(b"r1", '>'), ("r1".to_string(), None));
    }

    #[test]
    fn test_read_records_plain_and_gz() -> Result<()> {
        let dir = tempdir()?;
        let plain = dir.path().join("reads.fastq");
        std::fs::write(&plain, FASTQ)?;

        let gz = dir.path().join("reads2.fq.gz");
        let mut enc = GzEncoder::new(File::create(&gz)?, Compression::default());
        enc.write_all(FASTQ.as_bytes())?;
        enc.finish()?;

        for path in [plain, gz] {
            let records = read_records(&path)?;
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].id(), "read1");
            assert_eq!(records[0].seq(), b"ACGT");
            assert_eq!(records[0].channel(), Some(7));
            assert_eq!(records[0].read_number(), Some(12));
            assert_eq!(records[1].channel(), Some(300));
            assert_eq!(records[1].read_number(), None);
        }
        Ok(())
    }

    #[test]
    fn test_contig_lengths() -> Result<()> {
        let dir = tempdir()?;
        let fasta = dir.path().join("ref.fa");
        std::fs::write(&fasta, ">chr1 first\nACGTACGT\nACGT\n>chr2\nAC\n")?;
        assert_eq!(
            contig_lengths(&fasta)?,
            vec![("chr1".to_string(), 12), ("chr2".to_string(), 2)]
        );
        Ok(())
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(fastx_filetype(Path::new("reads.bam")).is_err());
        assert_eq!(fastx_filetype(Path::new("reads.fq.gz")).unwrap(), FASTQ_TAG);
    }

    #[tokio::test]
    async fn test_read_sequences_skips_missing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("reads.fastq");
        std::fs::write(&path, FASTQ)?;

        let (mut rx, progress) = read_sequences(vec![(dir.path().join("missing.fastq"), 0), (path.clone(), 0)], 4);
        let mut ids = Vec::new();
        while let Some(record) = rx.recv().await {
            ids.push(record.id().to_string());
        }
        assert_eq!(ids, vec!["read1", "read2"]);
        assert_eq!(progress.await?, vec![(path, 2)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_sequences_resumes_after_offset() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("growing.fastq");
        // second record is only half written
        std::fs::write(&path, "@read1 ch=1\nACGT\n+\nIIII\n@read2 ch=2\nGG")?;

        let (mut rx, progress) = read_sequences(vec![(path.clone(), 0)], 4);
        let mut ids = Vec::new();
        while let Some(record) = rx.recv().await {
            ids.push(record.id().to_string());
        }
        assert_eq!(ids, vec!["read1"]);
        assert_eq!(progress.await?, vec![(path.clone(), 1)]);

        std::fs::write(&path, "@read1 ch=1\nACGT\n+\nIIII\n@read2 ch=2\nGGCC\n+\nIIII\n@read3 ch=3\nTT\n+\nII\n")?;
        let (mut rx, progress) = read_sequences(vec![(path.clone(), 1)], 4);
        let mut ids = Vec::new();
        while let Some(record) = rx.recv().await {
            ids.push(record.id().to_string());
        }
        assert_eq!(ids, vec!["read2", "read3"]);
        assert_eq!(progress.await?, vec![(path, 3)]);
        Ok(())
    }
}
