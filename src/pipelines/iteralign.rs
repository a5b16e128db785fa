// src/pipelines/iteralign.rs: Watch-folder mapping loop that tracks coverage and stops the run at depth
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap as HashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::conditions::{describe_experiment, nice_join, ChannelAssignment, ExperimentConfig};
use crate::config::defs::{PipelineError, RunConfig, MAP_BATCH_SIZE, TAXON_REFERENCE_PREFIX, WATCH_REFERENCE_NAME};
use crate::utils::coverage::CoverageTracker;
use crate::utils::decisions::{classify_read, DecisionEvent, DecisionTracker};
use crate::utils::fastx::{contig_lengths, read_sequences, SequenceRecord};
use crate::utils::file::FolderScanner;
use crate::utils::instrument::{InstrumentControl, Severity, SimulatedInstrument};
use crate::utils::mapping::{spawn_eviction, IndexLoader, Minimap2Loader, Query, ReferenceRegistry};
use crate::utils::taxonomy::{LocalReferenceSource, ReferenceSource, ReportFeed};


/// State of one watch-mode experiment: the channel split, live targets, coverage and
/// the instrument being driven.
pub struct CoverageSession<L: IndexLoader, I: InstrumentControl> {
    experiment: ExperimentConfig,
    assignment: ChannelAssignment,
    registry: Arc<ReferenceRegistry<L>>,
    coverage: Arc<CoverageTracker>,
    instrument: Arc<I>,
    reference: PathBuf,
    /// Every reference reads are mapped against, the experiment's own first.
    references: Vec<(String, PathBuf)>,
    percent: f64,
    percent_notified: bool,
    stopped: bool,
    trackers: Vec<DecisionTracker>,
}

impl<L: IndexLoader, I: InstrumentControl> CoverageSession<L, I> {
    pub fn new(
        experiment: ExperimentConfig,
        channels: usize,
        registry: Arc<ReferenceRegistry<L>>,
        instrument: Arc<I>,
        percent: f64,
    ) -> Result<Self, PipelineError> {
        let reference = experiment
            .reference
            .clone()
            .ok_or_else(|| PipelineError::InvalidConfig("iteralign requires conditions.reference".to_string()))?;
        let assignment = experiment.assign_channels(channels)?;
        let trackers = vec![DecisionTracker::new(); assignment.conditions().len()];
        let coverage = registry.coverage().clone();

        Ok(Self {
            experiment,
            assignment,
            registry,
            coverage,
            instrument,
            references: vec![(WATCH_REFERENCE_NAME.to_string(), reference.clone())],
            reference,
            percent,
            percent_notified: false,
            stopped: false,
            trackers,
        })
    }

    pub fn assignment(&self) -> &ChannelAssignment {
        &self.assignment
    }

    pub fn coverage(&self) -> &Arc<CoverageTracker> {
        &self.coverage
    }

    pub fn decision_trackers(&self) -> &[DecisionTracker] {
        &self.trackers
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Writes the initial live config and loads the reference.
    pub async fn start(&mut self) -> Result<PathBuf, PipelineError> {
        let live = self.experiment.write_live(&self.assignment)?;
        self.registry.load(WATCH_REFERENCE_NAME, &self.reference).await?;
        Ok(live)
    }

    /// Sends the experiment description to the instrument.
    pub fn describe(&self) {
        let lengths: HashMap<String, u64> = self
            .registry
            .contig_lengths(WATCH_REFERENCE_NAME)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let name = self.reference.display().to_string();
        for (severity, message) in describe_experiment(self.assignment.conditions(), Some((&name, &lengths))) {
            self.instrument.send_user_message(severity, &message);
        }
    }

    /// Names of the references reads are mapped against.
    pub fn reference_names(&self) -> Vec<&str> {
        self.references.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Loads another reference; its contigs are tracked and every later batch is mapped
    /// against it as well. A name already present is reloaded in place.
    pub async fn add_reference(&mut self, name: &str, path: &Path) -> Result<(), PipelineError> {
        self.registry.load(name, path).await?;
        match self.references.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = path.to_path_buf(),
            None => self.references.push((name.to_string(), path.to_path_buf())),
        }
        Ok(())
    }

    async fn ensure_references(&self) -> Result<(), PipelineError> {
        for (name, path) in &self.references {
            if !self.registry.is_available(name) {
                info!("Reference {} was evicted while idle, reloading {}", name, path.display());
                self.registry.load(name, path).await?;
            }
        }
        Ok(())
    }

    /// Maps a batch of reads and records every hit against the condition owning the
    /// read's channel.
    ///
    /// # Returns
    /// Number of hits landing in a target window.
    pub async fn process_batch(&mut self, records: Vec<SequenceRecord>) -> Result<usize, PipelineError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.ensure_references().await?;

        let queries: Vec<Query> = records
            .iter()
            .map(|r| Query { read_id: r.id().to_string(), sequence: r.seq().to_vec() })
            .collect();
        let mut mapped = self.registry.map(WATCH_REFERENCE_NAME, &queries).await?;
        for (name, _) in self.references.iter().skip(1) {
            let extra = self.registry.map(name, &queries).await?;
            for (read, more) in mapped.iter_mut().zip(extra) {
                read.hits.extend(more.hits);
            }
        }

        let mut on_target = 0;
        for (record, read) in records.iter().zip(mapped.iter()) {
            let index = record.channel().and_then(|ch| self.assignment.condition_index(ch));
            let condition = index.map(|i| &self.assignment.conditions()[i]);

            if let (Some(i), Some(condition)) = (index, condition) {
                let class = classify_read(condition, record.seq().len(), &read.hits);
                self.trackers[i].event_seen(DecisionEvent::from(condition.decision(class)));
            } else {
                debug!("Read {} has no channel assignment", record.id());
            }

            for hit in &read.hits {
                if self.coverage.record_alignment(hit, condition) {
                    on_target += 1;
                }
            }
        }
        debug!("Mapped {} reads, {} on-target hits", records.len(), on_target);
        Ok(on_target)
    }

    /// Applies coverage progress to the targets and the instrument.
    ///
    /// # Returns
    /// true once the run has been stopped.
    pub fn update_targets(&mut self) -> Result<bool, PipelineError> {
        if self.stopped {
            return Ok(true);
        }

        let covered = self.coverage.take_newly_covered_contigs();
        if !covered.is_empty() {
            let message = format!("Updating targets with {}", nice_join(&covered, ", ", "and"));
            warn!("{}", message);
            self.instrument.send_user_message(Severity::Warn, &message);
        }

        let satisfied = self.coverage.take_newly_satisfied();
        let mut removed = 0;
        for (contig, lefts) in &satisfied {
            removed += self.assignment.exclude_windows(contig, lefts);
        }
        if removed > 0 {
            info!("Removed {} satisfied target{} from the live config", removed, if removed == 1 { "" } else { "s" });
            self.experiment.write_live(&self.assignment)?;
        }

        if !self.percent_notified && self.coverage.fraction_at_depth() >= self.percent {
            self.percent_notified = true;
            self.instrument.send_user_message(
                Severity::Info,
                &format!("{:.2}% of contigs are at the target depth", self.percent * 100.0),
            );
        }

        if self.coverage.tracked_contigs() > 0 && self.coverage.check_complete() {
            self.stopped = true;
            if self.instrument.stop_protocol() {
                let message = format!(
                    "All targets have reached {}x coverage, stopping the run",
                    self.coverage.depth_target()
                );
                warn!("{}", message);
                self.instrument.send_user_message(Severity::Warn, &message);
            }
            return Ok(true);
        }
        Ok(false)
    }

    pub fn log_report(&self) {
        for entry in self.coverage.report() {
            info!("{}\t{} bases\t{:.2}x", entry.name, entry.bases, entry.coverage);
        }
        for (condition, tracker) in self.assignment.conditions().iter().zip(&self.trackers) {
            match (tracker.proportion_accepted(), tracker.proportion_rejected()) {
                (Some(accepted), Some(rejected)) => info!(
                    "Region '{}': {} reads, {:.2}% accepted, {:.2}% rejected",
                    condition.name,
                    tracker.total_reads(),
                    accepted,
                    rejected
                ),
                _ => info!("Region '{}': no reads decided", condition.name),
            }
        }
    }
}


/// Reads whatever the scanner has not yet seen and feeds it through the session in
/// batches. Files that grew since the last call are resumed after their last consumed record.
///
/// # Returns
/// Number of reads processed.
pub async fn ingest_new_reads<L: IndexLoader, I: InstrumentControl>(
    session: &mut CoverageSession<L, I>,
    scanner: &mut FolderScanner,
) -> Result<usize, PipelineError> {
    let files = scanner.scan()?;
    if files.is_empty() {
        return Ok(0);
    }
    debug!("Found {} new or modified files in {}", files.len(), scanner.root().display());

    let (rx, progress) = read_sequences(files, MAP_BATCH_SIZE * 2);
    let mut batches = ReceiverStream::new(rx).chunks(MAP_BATCH_SIZE);
    let mut processed = 0;
    while let Some(batch) = batches.next().await {
        processed += batch.len();
        session.process_batch(batch).await?;
    }
    let progress = progress.await.map_err(|e| PipelineError::IOError(e.to_string()))?;
    scanner.mark_consumed(progress);
    Ok(processed)
}


/// Loads a reference for every taxon the feed reports as newly above threshold.
///
/// # Returns
/// Number of references added.
pub async fn apply_reports<L: IndexLoader, I: InstrumentControl, S: ReferenceSource>(
    session: &mut CoverageSession<L, I>,
    feed: &mut ReportFeed<S>,
) -> Result<usize, PipelineError> {
    let acquired = feed.poll().await.map_err(|e| PipelineError::IOError(e.to_string()))?;
    let mut added = 0;
    for (tax_id, path) in acquired {
        let name = format!("{}{}", TAXON_REFERENCE_PREFIX, tax_id);
        match session.add_reference(&name, &path).await {
            Ok(()) => added += 1,
            Err(e) => warn!("Could not load reference for taxid {}: {}", tax_id, e),
        }
    }
    Ok(added)
}


/// Scans `scanner` every `poll` and feeds new reads through the session until the run
/// stops or ctrl-c is received. With a report feed, references for newly classified taxa
/// are added before each scan.
pub async fn watch_loop<L: IndexLoader, I: InstrumentControl, S: ReferenceSource>(
    session: &mut CoverageSession<L, I>,
    scanner: &mut FolderScanner,
    mut feed: Option<&mut ReportFeed<S>>,
    poll: Duration,
) -> Result<(), PipelineError> {
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving the watch loop");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Some(feed) = feed.as_deref_mut() {
                    apply_reports(session, feed).await?;
                }
                ingest_new_reads(session, scanner).await?;
                if session.update_targets()? {
                    return Ok(());
                }
            }
        }
    }
}


fn resolve(cwd: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() { path } else { cwd.join(path) }
}


/// Validates the experiment and prints its description without mapping anything.
pub async fn describe(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let toml = config
        .args
        .toml
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig("describe requires --toml".to_string()))?;
    let experiment = ExperimentConfig::load(resolve(&config.cwd, toml), config.args.seed)?;
    let assignment = experiment.assign_channels(config.args.channels)?;
    for (index, condition) in assignment.conditions().iter().enumerate() {
        let channels = assignment.channels(index);
        debug!(
            "Region '{}' on channels {}..={}",
            condition.name,
            channels.first().copied().unwrap_or(0),
            channels.last().copied().unwrap_or(0)
        );
    }

    let instrument = SimulatedInstrument::new();
    let messages = match &experiment.reference {
        Some(reference) => {
            let path = reference.clone();
            let lengths: HashMap<String, u64> = tokio::task::spawn_blocking(move || contig_lengths(&path))
                .await
                .map_err(|e| PipelineError::IOError(e.to_string()))??
                .into_iter()
                .collect();
            let name = reference.display().to_string();
            describe_experiment(assignment.conditions(), Some((&name, &lengths)))
        }
        None => describe_experiment(assignment.conditions(), None),
    };
    for (severity, message) in messages {
        instrument.send_user_message(severity, &message);
    }
    Ok(())
}


pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let args = &config.args;
    let toml = args
        .toml
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig("iteralign requires --toml".to_string()))?;
    let watch = args
        .watch
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig("iteralign requires --watch".to_string()))?;
    let watch = resolve(&config.cwd, watch);
    if !watch.is_dir() {
        return Err(PipelineError::InvalidConfig(format!("Watch folder {} does not exist", watch.display())));
    }

    // classifier reports and the references for their taxa come as a pair
    let taxon_dest = tempfile::tempdir()?;
    let mut feed = match (args.reports.as_deref(), args.references.as_deref()) {
        (Some(reports), Some(references)) => {
            info!("Following classifier reports in {}", reports);
            Some(ReportFeed::new(
                resolve(&config.cwd, reports),
                LocalReferenceSource::new(resolve(&config.cwd, references)),
                args.taxon_threshold,
                taxon_dest.path(),
            ))
        }
        (None, None) => None,
        _ => {
            return Err(PipelineError::InvalidConfig("--reports and --references must be given together".to_string()));
        }
    };

    let experiment = ExperimentConfig::load(resolve(&config.cwd, toml), args.seed)?;
    let coverage = Arc::new(CoverageTracker::new(args.depth as f64));
    let registry = Arc::new(ReferenceRegistry::new(Minimap2Loader::new(config.threads), coverage));
    let instrument = Arc::new(SimulatedInstrument::new());

    let mut session = CoverageSession::new(experiment, args.channels, registry.clone(), instrument, args.percent)?;
    let live = session.start().await?;
    info!("Live targets at {}", live.display());

    let mut eviction = spawn_eviction(registry, Duration::from_secs(args.evict_interval_secs));
    session.describe();

    let mut scanner = FolderScanner::new(&watch);
    let poll = Duration::from_secs(args.watch_poll_secs.max(1));
    let result = watch_loop(&mut session, &mut scanner, feed.as_mut(), poll).await;

    eviction.stop().await;
    session.log_report();
    result
}
