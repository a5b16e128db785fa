// src/utils/taxonomy.rs: Classifier report tracking and reference acquisition for new taxa
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use fxhash::FxHashSet as HashSet;
use log::{info, warn, debug};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::defs::{FASTA_EXTS, GZIP_EXT, REPORT_EXTS};
use crate::utils::file::extension_remover;

pub type Taxid = u32;  // NCBI taxids fit in u32


#[derive(Debug, Clone, PartialEq)]
pub struct TaxonRecord {
    pub name: String,
    pub tax_id: Taxid,
    pub rank: String,
    pub genome_size: u64,
    pub num_reads: u64,
    pub num_unique_reads: u64,
    pub abundance: f64,
}

impl TaxonRecord {
    /// Parses one row of a classifier report:
    /// name, taxID, rank, genomeSize, numReads, numUniqueReads, abundance.
    pub fn parse_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split('\t').map(|s| s.trim()).collect();
        if parts.len() < 7 {
            return Err(anyhow!("Expected 7 report columns, found {}: {}", parts.len(), line));
        }
        Ok(Self {
            name: parts[0].to_string(),
            tax_id: parts[1].parse()?,
            rank: parts[2].to_string(),
            genome_size: parts[3].parse()?,
            num_reads: parts[4].parse()?,
            num_unique_reads: parts[5].parse()?,
            abundance: parts[6].parse()?,
        })
    }
}


/// Unique-read totals per taxon across successive classifier reports.
#[derive(Debug, Default)]
pub struct TaxonTracker {
    taxa: BTreeMap<Taxid, TaxonRecord>,
    reported: HashSet<Taxid>,
}

impl TaxonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record, summing unique reads with any earlier record of the taxon.
    pub fn add_taxon(&mut self, record: TaxonRecord) {
        match self.taxa.get_mut(&record.tax_id) {
            Some(existing) => {
                existing.num_reads += record.num_reads;
                existing.num_unique_reads += record.num_unique_reads;
            }
            None => {
                self.taxa.insert(record.tax_id, record);
            }
        }
    }

    pub fn get(&self, tax_id: Taxid) -> Option<&TaxonRecord> {
        self.taxa.get(&tax_id)
    }

    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    /// Reads a tab-separated report with a header line into the tracker.
    ///
    /// # Returns
    /// Number of rows added.
    pub async fn add_report(&mut self, report: &Path) -> Result<usize> {
        let file = File::open(report).await?;
        let mut lines = BufReader::new(file).lines();
        let mut added = 0;

        // header
        if lines.next_line().await?.is_none() {
            return Ok(0);
        }
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() { continue; }
            self.add_taxon(TaxonRecord::parse_line(&line)?);
            added += 1;
        }
        debug!("Added {} taxa from {}", added, report.display());
        Ok(added)
    }

    /// Taxa whose unique reads newly reached `threshold`. Each taxon is returned once.
    pub fn calculate_targets(&mut self, threshold: u64) -> Vec<TaxonRecord> {
        let mut new_targets = Vec::new();
        for (tax_id, record) in &self.taxa {
            if record.num_unique_reads >= threshold && self.reported.insert(*tax_id) {
                new_targets.push(record.clone());
            }
        }
        new_targets
    }
}


/// Fetches a reference genome for a taxon.
pub trait ReferenceSource: Send + Sync {
    fn fetch(&self, taxon: &TaxonRecord, dest: &Path) -> impl Future<Output = Result<PathBuf>> + Send;
}


/// Fetches a reference for each taxon into `dest`. Failures are logged and skipped.
///
/// # Arguments
///
/// * `source` - Where references come from.
/// * `taxa` - Taxa needing references.
/// * `dest` - Directory receiving the files.
///
/// # Returns
/// (taxid, path) of each reference obtained.
pub async fn acquire_references<S: ReferenceSource>(
    source: &S,
    taxa: &[TaxonRecord],
    dest: &Path,
) -> Vec<(Taxid, PathBuf)> {
    let mut acquired = Vec::with_capacity(taxa.len());
    for taxon in taxa {
        match source.fetch(taxon, dest).await {
            Ok(path) => {
                info!("Acquired reference for {} ({}) at {}", taxon.name, taxon.tax_id, path.display());
                acquired.push((taxon.tax_id, path));
            }
            Err(e) => warn!("Skipping {} ({}): {}", taxon.name, taxon.tax_id, e),
        }
    }
    acquired
}


/// Serves references from a local directory of `<taxid>.<fasta ext>` files, optionally gzipped.
#[derive(Debug, Clone)]
pub struct LocalReferenceSource {
    dir: PathBuf,
}

impl LocalReferenceSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    async fn find(&self, tax_id: Taxid) -> Result<Option<PathBuf>> {
        let wanted = tax_id.to_string();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let (stem, extensions) = extension_remover(&path);
            if stem.file_name().is_none_or(|n| n.to_string_lossy() != wanted) {
                continue;
            }
            let mut exts = extensions.iter().rev();
            let last = match exts.next() {
                Some(e) if e.eq_ignore_ascii_case(GZIP_EXT) => exts.next(),
                other => other,
            };
            if last.is_some_and(|e| FASTA_EXTS.iter().any(|f| f.eq_ignore_ascii_case(e))) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

impl ReferenceSource for LocalReferenceSource {
    async fn fetch(&self, taxon: &TaxonRecord, dest: &Path) -> Result<PathBuf> {
        let source = self
            .find(taxon.tax_id)
            .await?
            .ok_or_else(|| anyhow!("No reference for taxid {} in {}", taxon.tax_id, self.dir.display()))?;
        let file_name = source.file_name().ok_or_else(|| anyhow!("Bad reference path {}", source.display()))?;
        let target = dest.join(file_name);
        tokio::fs::copy(&source, &target).await?;
        Ok(target)
    }
}


/// Follows a folder of classifier reports. Each report is read once; taxa crossing the
/// unique-read threshold get a reference from the source.
pub struct ReportFeed<S: ReferenceSource> {
    reports: PathBuf,
    read: HashSet<PathBuf>,
    tracker: TaxonTracker,
    source: S,
    threshold: u64,
    dest: PathBuf,
}

impl<S: ReferenceSource> ReportFeed<S> {
    /// # Arguments
    ///
    /// * `reports` - Folder the classifier writes its reports to.
    /// * `source` - Where references for new taxa come from.
    /// * `threshold` - Unique reads a taxon needs before it becomes a target.
    /// * `dest` - Directory receiving acquired references.
    pub fn new<P: AsRef<Path>, D: AsRef<Path>>(reports: P, source: S, threshold: u64, dest: D) -> Self {
        Self {
            reports: reports.as_ref().to_path_buf(),
            read: HashSet::default(),
            tracker: TaxonTracker::new(),
            source,
            threshold,
            dest: dest.as_ref().to_path_buf(),
        }
    }

    pub fn tracker(&self) -> &TaxonTracker {
        &self.tracker
    }

    /// Reads reports that appeared since the last poll and acquires references for taxa
    /// that newly reached the threshold.
    ///
    /// # Returns
    /// (taxid, path) of each reference acquired on this poll.
    pub async fn poll(&mut self) -> Result<Vec<(Taxid, PathBuf)>> {
        let mut fresh = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.reports).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_report = path
                .extension()
                .is_some_and(|e| REPORT_EXTS.iter().any(|r| e.eq_ignore_ascii_case(r)));
            if is_report && entry.file_type().await?.is_file() && !self.read.contains(&path) {
                fresh.push(path);
            }
        }
        fresh.sort();

        for report in fresh {
            match self.tracker.add_report(&report).await {
                Ok(added) => debug!("Read {} taxa from {}", added, report.display()),
                Err(e) => warn!("Skipping report {}: {}", report.display(), e),
            }
            self.read.insert(report);
        }

        let targets = self.tracker.calculate_targets(self.threshold);
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        info!(
            "{} taxa reached {} unique reads: {}",
            targets.len(),
            self.threshold,
            targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(acquire_references(&self.source, &targets, &self.dest).await)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "name\ttaxID\ttaxRank\tgenomeSize\tnumReads\tnumUniqueReads\tabundance";

    fn report(rows: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
        file
    }

    #[tokio::test]
    async fn test_reports_accumulate() -> Result<()> {
        let mut tracker = TaxonTracker::new();
        let first = report(&[
            "Escherichia coli\t562\tspecies\t4641652\t40\t30\t0.5",
            "Homo sapiens\t9606\tspecies\t3100000000\t10\t2\t0.1",
        ]);
        let second = report(&["Escherichia coli\t562\tspecies\t4641652\t50\t25\t0.6"]);

        assert_eq!(tracker.add_report(first.path()).await?, 2);
        assert_eq!(tracker.add_report(second.path()).await?, 1);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.get(562).map(|t| t.num_unique_reads), Some(55));
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_row_is_an_error() {
        let mut tracker = TaxonTracker::new();
        let bad = report(&["Escherichia coli\tnot_a_taxid\tspecies\t1\t1\t1\t0.1"]);
        assert!(tracker.add_report(bad.path()).await.is_err());
        let short = report(&["Escherichia coli\t562"]);
        assert!(tracker.add_report(short.path()).await.is_err());
    }

    #[test]
    fn test_targets_reported_once() -> Result<()> {
        let mut tracker = TaxonTracker::new();
        tracker.add_taxon(TaxonRecord::parse_line("A\t1\tspecies\t100\t5\t5\t0.1")?);
        tracker.add_taxon(TaxonRecord::parse_line("B\t2\tspecies\t100\t5\t1\t0.1")?);

        let first: Vec<Taxid> = tracker.calculate_targets(5).iter().map(|t| t.tax_id).collect();
        assert_eq!(first, vec![1]);
        assert!(tracker.calculate_targets(5).is_empty());

        tracker.add_taxon(TaxonRecord::parse_line("B\t2\tspecies\t100\t5\t4\t0.1")?);
        let second: Vec<Taxid> = tracker.calculate_targets(5).iter().map(|t| t.tax_id).collect();
        assert_eq!(second, vec![2]);
        Ok(())
    }

    struct StubSource;

    impl ReferenceSource for StubSource {
        async fn fetch(&self, taxon: &TaxonRecord, dest: &Path) -> Result<PathBuf> {
            if taxon.tax_id == 13 {
                return Err(anyhow!("no assembly available"));
            }
            let path = dest.join(format!("{}.fasta", taxon.tax_id));
            tokio::fs::write(&path, format!(">{}\nACGT\n", taxon.name)).await?;
            Ok(path)
        }
    }

    #[tokio::test]
    async fn test_acquire_skips_failures() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let taxa = vec![
            TaxonRecord::parse_line("A\t11\tspecies\t100\t5\t5\t0.1")?,
            TaxonRecord::parse_line("B\t13\tspecies\t100\t5\t5\t0.1")?,
            TaxonRecord::parse_line("C\t17\tspecies\t100\t5\t5\t0.1")?,
        ];
        let acquired = acquire_references(&StubSource, &taxa, dir.path()).await;
        let ids: Vec<Taxid> = acquired.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![11, 17]);
        assert!(acquired.iter().all(|(_, p)| p.exists()));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_source_finds_taxid_file() -> Result<()> {
        let refs = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        std::fs::write(refs.path().join("562.fna"), ">ecoli\nACGT\n")?;
        std::fs::write(refs.path().join("5620.fasta"), ">other\nACGT\n")?;
        std::fs::write(refs.path().join("9606.txt"), "not a reference")?;

        let source = LocalReferenceSource::new(refs.path());
        let ecoli = TaxonRecord::parse_line("E. coli\t562\tspecies\t100\t5\t5\t0.1")?;
        let path = source.fetch(&ecoli, dest.path()).await?;
        assert_eq!(path, dest.path().join("562.fna"));
        assert_eq!(std::fs::read_to_string(&path)?, ">ecoli\nACGT\n");

        let human = TaxonRecord::parse_line("H. sapiens\t9606\tspecies\t100\t5\t5\t0.1")?;
        assert!(source.fetch(&human, dest.path()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_report_feed_reads_each_report_once() -> Result<()> {
        let reports = tempfile::tempdir()?;
        let refs = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        std::fs::write(refs.path().join("562.fasta"), ">ecoli\nACGT\n")?;

        let row = "Escherichia coli\t562\tspecies\t4641652\t40\t30\t0.5";
        std::fs::write(reports.path().join("batch_0.tsv"), format!("{}\n{}\n", HEADER, row))?;
        std::fs::write(reports.path().join("ignored.log"), "noise")?;

        let mut feed = ReportFeed::new(reports.path(), LocalReferenceSource::new(refs.path()), 50, dest.path());
        assert!(feed.poll().await?.is_empty());
        // the same report is not counted again
        assert!(feed.poll().await?.is_empty());
        assert_eq!(feed.tracker().get(562).map(|t| t.num_unique_reads), Some(30));

        std::fs::write(reports.path().join("batch_1.tsv"), format!("{}\n{}\n", HEADER, row))?;
        let acquired = feed.poll().await?;
        assert_eq!(acquired, vec![(562, dest.path().join("562.fasta"))]);
        assert!(feed.poll().await?.is_empty());
        Ok(())
    }
}
