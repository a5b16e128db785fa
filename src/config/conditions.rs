// src/config/conditions.rs: Experiment TOML, per-condition targets and the channel map
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fxhash::FxHashMap as HashMap;
use log::{debug, info};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::defs::{PipelineError, DEFAULT_SIGNAL_CHUNK, LIVE_TOML_SUFFIX};
use crate::utils::decisions::ReadClass;
use crate::utils::flowcell::generate_flowcell;
use crate::utils::instrument::Severity;
use crate::utils::system::generate_rng;


/// Outcome configured for a read class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Unblock,
    StopReceiving,
    Proceed,
}

impl Decision {
    pub const ALL: [Decision; 3] = [Decision::Unblock, Decision::StopReceiving, Decision::Proceed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Unblock => "unblock",
            Decision::StopReceiving => "stop_receiving",
            Decision::Proceed => "proceed",
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Strand::Forward),
            "-" => Some(Strand::Reverse),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Strand::Forward => "+",
            Strand::Reverse => "-",
        }
    }
}


/// Closed interval of reference coordinates. `end == u64::MAX` means the whole contig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInterval {
    pub start: u64,
    pub end: u64,
}

impl TargetInterval {
    pub fn new(start: u64, end: u64) -> Self {
        TargetInterval { start, end }
    }

    pub fn unbounded() -> Self {
        TargetInterval { start: 0, end: u64::MAX }
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == u64::MAX
    }

    /// Number of bases covered; unbounded intervals take the contig length.
    pub fn size(&self, contig_length: u64) -> u64 {
        if self.is_unbounded() {
            contig_length
        } else {
            self.end.abs_diff(self.start).saturating_add(1)
        }
    }
}


/// Return true if `pos` lies within the interval, bounds inclusive.
pub fn between(pos: u64, interval: &TargetInterval) -> bool {
    let lo = interval.start.min(interval.end);
    let hi = interval.start.max(interval.end);
    lo <= pos && pos <= hi
}


/// strand -> contig -> intervals
pub type TargetMap = BTreeMap<Strand, BTreeMap<String, Vec<TargetInterval>>>;


/// Parses target strings of the form `contig,start,end,strand` or a bare `contig`.
/// A bare contig targets the whole contig on both strands.
pub fn parse_targets<S: AsRef<str>>(items: &[S]) -> Result<TargetMap, PipelineError> {
    let mut targets: TargetMap = BTreeMap::new();

    for item in items {
        let item = item.as_ref().trim();
        if item.is_empty() {
            continue;
        }
        let parts: Vec<&str> = item.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [contig] => {
                for strand in [Strand::Forward, Strand::Reverse] {
                    targets
                        .entry(strand)
                        .or_default()
                        .entry(contig.to_string())
                        .or_default()
                        .push(TargetInterval::unbounded());
                }
            }
            [contig, start, end, strand] => {
                let malformed = || PipelineError::InvalidConfig(format!("Malformed target '{}'", item));
                let start: u64 = start.parse().map_err(|_| malformed())?;
                let end: u64 = end.parse().map_err(|_| malformed())?;
                let strand = Strand::parse(strand).ok_or_else(malformed)?;
                if contig.is_empty() {
                    return Err(malformed());
                }
                targets
                    .entry(strand)
                    .or_default()
                    .entry(contig.to_string())
                    .or_default()
                    .push(TargetInterval::new(start, end));
            }
            _ => {
                return Err(PipelineError::InvalidConfig(format!("Malformed target '{}'", item)));
            }
        }
    }
    Ok(targets)
}


fn read_lines_to_list(path: &Path) -> Result<Vec<String>, PipelineError> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}


#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum TargetsField {
    File(String),
    List(Vec<String>),
}

impl Default for TargetsField {
    fn default() -> Self {
        TargetsField::List(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionTable {
    name: String,
    #[serde(default)]
    control: bool,
    #[serde(default)]
    targets: TargetsField,
    single_on: Decision,
    single_off: Decision,
    multi_on: Decision,
    multi_off: Decision,
    no_map: Decision,
    no_seq: Decision,
}


/// One set of experiment rules applied to a region of the flowcell.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: String,
    pub name: String,
    pub control: bool,
    pub single_on: Decision,
    pub single_off: Decision,
    pub multi_on: Decision,
    pub multi_off: Decision,
    pub no_map: Decision,
    pub no_seq: Decision,
    targets: TargetMap,
}

impl Condition {
    fn from_table(key: &str, table: ConditionTable) -> Result<Self, PipelineError> {
        let lines = match table.targets {
            TargetsField::List(list) => list,
            TargetsField::File(path) => {
                let path = PathBuf::from(&path);
                if !path.is_file() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Targets file not found at '{}'",
                        path.display()
                    )));
                }
                read_lines_to_list(&path)?
            }
        };

        Ok(Condition {
            key: key.to_string(),
            name: table.name,
            control: table.control,
            single_on: table.single_on,
            single_off: table.single_off,
            multi_on: table.multi_on,
            multi_off: table.multi_off,
            no_map: table.no_map,
            no_seq: table.no_seq,
            targets: parse_targets(&lines)?,
        })
    }

    /// Condition keeping on-target reads and unblocking everything else that maps.
    pub fn new(key: &str, name: &str, targets: TargetMap) -> Self {
        Condition {
            key: key.to_string(),
            name: name.to_string(),
            control: false,
            single_on: Decision::StopReceiving,
            single_off: Decision::Unblock,
            multi_on: Decision::StopReceiving,
            multi_off: Decision::Unblock,
            no_map: Decision::Proceed,
            no_seq: Decision::Proceed,
            targets,
        }
    }

    pub fn targets(&self) -> &TargetMap {
        &self.targets
    }

    /// Intervals targeted on `contig` for one strand, in configuration order.
    pub fn intervals(&self, contig: &str, strand: Strand) -> &[TargetInterval] {
        self.targets
            .get(&strand)
            .and_then(|contigs| contigs.get(contig))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First interval on `contig`/`strand` containing `coordinate`.
    pub fn matching_interval(&self, contig: &str, strand: Strand, coordinate: u64) -> Option<&TargetInterval> {
        self.intervals(contig, strand)
            .iter()
            .find(|interval| between(coordinate, interval))
    }

    /// Distinct contigs named by any target.
    pub fn contigs(&self) -> BTreeSet<&str> {
        self.targets
            .values()
            .flat_map(|contigs| contigs.keys().map(String::as_str))
            .collect()
    }

    /// Number of intervals, counting each strand separately.
    pub fn target_count(&self) -> usize {
        self.targets
            .values()
            .flat_map(|contigs| contigs.values())
            .map(Vec::len)
            .sum()
    }

    pub fn decision(&self, class: ReadClass) -> Decision {
        match class {
            ReadClass::SingleOn => self.single_on,
            ReadClass::SingleOff => self.single_off,
            ReadClass::MultiOn => self.multi_on,
            ReadClass::MultiOff => self.multi_off,
            ReadClass::NoMap => self.no_map,
            ReadClass::NoSeq => self.no_seq,
        }
    }

    /// Removes every interval on `contig` whose left coordinate is `left`, on both strands.
    /// Returns the number of intervals removed.
    pub fn remove_window(&mut self, contig: &str, left: u64) -> usize {
        let mut removed = 0;
        for contigs in self.targets.values_mut() {
            if let Some(intervals) = contigs.get_mut(contig) {
                let before = intervals.len();
                intervals.retain(|interval| interval.start != left);
                removed += before - intervals.len();
                if intervals.is_empty() {
                    contigs.remove(contig);
                }
            }
        }
        removed
    }

    /// Targets in their TOML string form. Whole-contig targets are written once as the bare name.
    pub fn target_strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut bare = BTreeSet::new();
        for (strand, contigs) in &self.targets {
            for (contig, intervals) in contigs {
                for interval in intervals {
                    if interval.is_unbounded() {
                        if bare.insert(contig.clone()) {
                            out.push(contig.clone());
                        }
                    } else {
                        out.push(format!("{},{},{},{}", contig, interval.start, interval.end, strand.symbol()));
                    }
                }
            }
        }
        out
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Pool,
    Inline,
}

/// `[caller_settings]`: selects and sizes the basecalling backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerSettings {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_signal_chunk")]
    pub signal_chunk: usize,
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_signal_chunk() -> usize {
    DEFAULT_SIGNAL_CHUNK
}

impl Default for CallerSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            signal_chunk: default_signal_chunk(),
            workers: None,
        }
    }
}


/// A loaded and validated experiment TOML.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub path: PathBuf,
    pub reference: Option<PathBuf>,
    pub maintain_order: bool,
    pub axis: usize,
    pub caller_settings: CallerSettings,
    conditions: Vec<Condition>,
    document: toml::Table,
}

impl ExperimentConfig {
    /// Loads the experiment TOML, checks file paths, parses targets and orders the conditions.
    ///
    /// # Arguments
    ///
    /// * `path` - Experiment TOML.
    /// * `seed` - Seed for the condition shuffle when `maintain_order` is false.
    ///
    /// # Returns
    /// ExperimentConfig with conditions in channel assignment order.
    pub fn load<P: AsRef<Path>>(path: P, seed: Option<u64>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PipelineError::InvalidConfig(format!(
                "TOML config file not found at '{}'",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_str_with_path(&content, path, seed)
    }

    fn from_str_with_path(content: &str, path: &Path, seed: Option<u64>) -> Result<Self, PipelineError> {
        let document: toml::Table = toml::from_str(content)
            .map_err(|e| PipelineError::InvalidConfig(format!("{}: {}", path.display(), e)))?;

        let section = document
            .get("conditions")
            .and_then(toml::Value::as_table)
            .ok_or_else(|| PipelineError::InvalidConfig("Missing [conditions] table".to_string()))?;

        let reference = match section.get("reference").and_then(toml::Value::as_str) {
            Some(r) if !r.is_empty() => {
                let reference = PathBuf::from(r);
                if !reference.is_file() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Reference file not found at '{}'",
                        reference.display()
                    )));
                }
                Some(reference)
            }
            _ => None,
        };

        let maintain_order = section
            .get("maintain_order")
            .and_then(toml::Value::as_bool)
            .unwrap_or(true);
        let axis = match section.get("axis") {
            None => 1,
            Some(value) => value
                .as_integer()
                .filter(|a| *a == 0 || *a == 1)
                .map(|a| a as usize)
                .ok_or_else(|| PipelineError::InvalidConfig(format!("axis must be 0 or 1, got {}", value)))?,
        };

        let mut keys: Vec<&String> = section
            .iter()
            .filter(|(_, value)| value.is_table())
            .map(|(key, _)| key)
            .collect();
        if keys.is_empty() {
            return Err(PipelineError::InvalidConfig("No conditions found in [conditions]".to_string()));
        }
        keys.sort();
        if !maintain_order {
            let mut rng = generate_rng(seed);
            keys.shuffle(&mut rng);
        }

        let mut conditions = Vec::with_capacity(keys.len());
        for key in keys {
            let table: ConditionTable = section[key.as_str()]
                .clone()
                .try_into()
                .map_err(|e| PipelineError::InvalidConfig(format!("conditions.{}: {}", key, e)))?;
            conditions.push(Condition::from_table(key, table)?);
        }

        let caller_settings: CallerSettings = match document.get("caller_settings") {
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|e| PipelineError::InvalidConfig(format!("caller_settings: {}", e)))?,
            None => CallerSettings::default(),
        };

        debug!("Loaded {} conditions from {}", conditions.len(), path.display());

        Ok(ExperimentConfig {
            path: path.to_path_buf(),
            reference,
            maintain_order,
            axis,
            caller_settings,
            conditions,
            document,
        })
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Splits the flowcell along the configured axis, one region per condition.
    pub fn assign_channels(&self, channels: usize) -> Result<ChannelAssignment, PipelineError> {
        ChannelAssignment::new(self.conditions.clone(), channels, self.axis)
    }

    pub fn live_path(&self) -> PathBuf {
        let mut live = self.path.clone().into_os_string();
        live.push(LIVE_TOML_SUFFIX);
        PathBuf::from(live)
    }

    /// Writes `<config>_live` with each condition's remaining targets.
    /// The file is replaced atomically; the original TOML is never touched.
    pub fn write_live(&self, assignment: &ChannelAssignment) -> Result<PathBuf, PipelineError> {
        let mut document = self.document.clone();
        if let Some(section) = document.get_mut("conditions").and_then(toml::Value::as_table_mut) {
            for condition in assignment.conditions() {
                if let Some(table) = section.get_mut(&condition.key).and_then(toml::Value::as_table_mut) {
                    let targets = condition
                        .target_strings()
                        .into_iter()
                        .map(toml::Value::String)
                        .collect();
                    table.insert("targets".to_string(), toml::Value::Array(targets));
                }
            }
        }

        let rendered = toml::to_string_pretty(&document)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;

        let live_path = self.live_path();
        let dir = match live_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&live_path)
            .map_err(|e| PipelineError::IOError(format!("{}: {}", live_path.display(), e.error)))?;

        info!("Wrote live targets to {}", live_path.display());
        Ok(live_path)
    }
}


/// Total, disjoint mapping of every flowcell channel to one condition.
#[derive(Debug, Clone)]
pub struct ChannelAssignment {
    conditions: Vec<Condition>,
    groups: Vec<Vec<u32>>,
    channel_map: HashMap<u32, usize>,
}

impl ChannelAssignment {
    pub fn new(conditions: Vec<Condition>, channels: usize, axis: usize) -> Result<Self, PipelineError> {
        if conditions.is_empty() {
            return Err(PipelineError::InvalidConfig("No conditions to assign".to_string()));
        }
        let groups = generate_flowcell(channels, conditions.len(), axis, false)?;

        let mut channel_map = HashMap::default();
        for (index, group) in groups.iter().enumerate() {
            for &channel in group {
                channel_map.insert(channel, index);
            }
        }

        Ok(ChannelAssignment {
            conditions,
            groups,
            channel_map,
        })
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn channels(&self, index: usize) -> &[u32] {
        self.groups.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn condition_index(&self, channel: u32) -> Option<usize> {
        self.channel_map.get(&channel).copied()
    }

    pub fn condition_for(&self, channel: u32) -> Option<&Condition> {
        self.condition_index(channel).map(|i| &self.conditions[i])
    }

    /// Shrinks every condition's targets by the satisfied windows of `contig`.
    pub fn exclude_windows(&mut self, contig: &str, lefts: &[u64]) -> usize {
        let mut removed = 0;
        for condition in &mut self.conditions {
            for &left in lefts {
                removed += condition.remove_window(contig, left);
            }
        }
        removed
    }
}


/// Joins a list with commas and a final conjunction: "a, b or c".
pub fn nice_join<S: AsRef<str>>(items: &[S], sep: &str, conjunction: &str) -> String {
    let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    match items.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            format!("{} {} {}", rest.join(sep), conjunction, last)
        }
        _ => items.join(sep),
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

fn decision_summary(condition: &Condition) -> HashMap<Decision, String> {
    let mut grouped: HashMap<Decision, Vec<&str>> = HashMap::default();
    for class in ReadClass::ALL {
        grouped.entry(condition.decision(class)).or_default().push(class.as_str());
    }
    Decision::ALL
        .iter()
        .map(|d| (*d, nice_join(grouped.get(d).map(Vec::as_slice).unwrap_or(&[]), ", ", "or")))
        .collect()
}


/// Human readable description of the experiment, one message per condition.
///
/// # Arguments
///
/// * `conditions` - Conditions in channel assignment order.
/// * `reference` - Reference name and contig lengths, if a reference is loaded.
///
/// # Returns
/// Vec of (severity, message) to forward to the instrument.
pub fn describe_experiment(
    conditions: &[Condition],
    reference: Option<(&str, &HashMap<String, u64>)>,
) -> Vec<(Severity, String)> {
    let mut messages = vec![(
        Severity::Info,
        format!(
            "This experiment has {} region{} on the flowcell",
            conditions.len(),
            plural(conditions.len())
        ),
    )];

    match reference {
        Some((name, lengths)) => {
            messages.push((Severity::Info, format!("Using reference: {}", name)));
            let ref_len: u64 = 2 * lengths.values().sum::<u64>();

            for condition in conditions {
                let summary = decision_summary(condition);
                let contigs = condition.contigs();
                let in_reference = contigs.iter().filter(|c| lengths.contains_key(**c)).count();

                let mut target_total: u64 = 0;
                for contig_map in condition.targets().values() {
                    for (contig, intervals) in contig_map {
                        let contig_len = lengths.get(contig).copied().unwrap_or(0);
                        for interval in intervals {
                            target_total += if interval.is_unbounded() {
                                contig_len
                            } else {
                                interval.end.abs_diff(interval.start)
                            };
                        }
                    }
                }
                let percent = if ref_len > 0 {
                    target_total as f64 / ref_len as f64 * 100.0
                } else {
                    0.0
                };

                messages.push((
                    Severity::Info,
                    format!(
                        "Region '{}' (control={}) has {} contig{} of which {} are in the reference. \
                         There are {} targets (including +/- strand) representing {:.2}% of the reference. \
                         Reads will be unblocked when classed as {}; sequenced when classed as {}; \
                         and polled for more data when classed as {}.",
                        condition.name,
                        condition.control,
                        contigs.len(),
                        plural(contigs.len()),
                        in_reference,
                        condition.target_count(),
                        percent,
                        summary[&Decision::Unblock],
                        summary[&Decision::StopReceiving],
                        summary[&Decision::Proceed],
                    ),
                ));
            }
        }
        None => {
            messages.push((Severity::Warn, "No reference file provided".to_string()));
            for condition in conditions {
                let summary = decision_summary(condition);
                let contigs = condition.contigs();
                messages.push((
                    Severity::Warn,
                    format!(
                        "Region '{}' (control={}) has {} contig{}. \
                         Reads will be unblocked when classed as {}; sequenced when classed as {}; \
                         and polled for more data when classed as {}.",
                        condition.name,
                        condition.control,
                        contigs.len(),
                        plural(contigs.len()),
                        summary[&Decision::Unblock],
                        summary[&Decision::StopReceiving],
                        summary[&Decision::Proceed],
                    ),
                ));
            }
        }
    }
    messages
}
