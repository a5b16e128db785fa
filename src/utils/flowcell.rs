// src/utils/flowcell.rs: Physical flowcell layouts and channel partitioning
use fxhash::FxHashMap as HashMap;
use lazy_static::lazy_static;
use ndarray::{s, Array2, Axis};

use crate::config::defs::{PipelineError, MINION_CHANNELS, PROMETHION_CHANNELS};

/// MinION channels are wired in strips of eight. Each pair is the first channel of the
/// upper half-strip (counting up) and the last channel of the lower half-strip (counting down).
const MINION_STRIP_STARTS: [(u32, u32); 8] = [
    (33, 8),
    (481, 456),
    (417, 392),
    (353, 328),
    (289, 264),
    (225, 200),
    (161, 136),
    (97, 72),
];

lazy_static! {
    static ref MINION_LAYOUT: HashMap<u32, (usize, usize)> = minion_layout();
}

fn minion_layout() -> HashMap<u32, (usize, usize)> {
    let mut layout = HashMap::default();
    for (block, &(upper, lower)) in MINION_STRIP_STARTS.iter().enumerate() {
        for n in 0..4u32 {
            let column = 31 - (block * 4 + n as usize);
            for p in 0..8u32 {
                layout.insert(upper + n * 8 + p, (column, 15 - p as usize));
                layout.insert(lower + n * 8 - p, (column, 7 - p as usize));
            }
        }
    }
    layout
}


/// Supported flowcell geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flowcell {
    MinION,
    PromethION,
}

impl Flowcell {
    pub fn from_channels(channels: usize) -> Result<Self, PipelineError> {
        match channels {
            MINION_CHANNELS => Ok(Flowcell::MinION),
            PROMETHION_CHANNELS => Ok(Flowcell::PromethION),
            _ => Err(PipelineError::UnknownFlowcell(channels)),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Flowcell::MinION => MINION_CHANNELS,
            Flowcell::PromethION => PROMETHION_CHANNELS,
        }
    }

    /// (rows, columns) of the physical layout.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Flowcell::MinION => (16, 32),
            Flowcell::PromethION => (25, 120),
        }
    }

    /// Returns the (column, row) of a channel.
    pub fn coords(&self, channel: u32) -> Result<(usize, usize), PipelineError> {
        if channel == 0 || channel as usize > self.channels() {
            return Err(PipelineError::InvalidChannel {
                channel,
                flowcell_size: self.channels(),
            });
        }
        match self {
            Flowcell::MinION => MINION_LAYOUT
                .get(&channel)
                .copied()
                .ok_or(PipelineError::InvalidChannel { channel, flowcell_size: MINION_CHANNELS }),
            Flowcell::PromethION => {
                // 12 blocks of 250 channels, each block 10 columns wide
                let block = (channel as usize - 1) / 250;
                let remainder = (channel as usize - 1) % 250;
                Ok((remainder % 10 + block * 10, remainder / 10))
            }
        }
    }
}


/// Return a channel's (column, row) given a flowcell size.
pub fn channel_coords(channel: u32, flowcell_size: usize) -> Result<(usize, usize), PipelineError> {
    Flowcell::from_channels(flowcell_size)?.coords(channel)
}


/// Builds an array in the shape of the flowcell, each cell holding its channel number.
/// Rows are in display order, so the bottom row of the array is row 0 of the layout.
///
/// # Arguments
///
/// * `flowcell_size` - Total number of channels; 512 for MinION, 3000 for PromethION.
///
/// # Returns
/// Array2 of channel numbers, (16, 32) for MinION and (25, 120) for PromethION.
pub fn flowcell_array(flowcell_size: usize) -> Result<Array2<u32>, PipelineError> {
    let flowcell = Flowcell::from_channels(flowcell_size)?;
    let mut arr = Array2::<u32>::zeros(flowcell.shape());

    for channel in 1..=flowcell_size as u32 {
        let (column, row) = flowcell.coords(channel)?;
        arr[[row, column]] = channel;
    }

    Ok(arr.slice(s![..;-1, ..]).to_owned())
}


/// Splits the flowcell into equally sized groups of channels.
///
/// Groups follow the physical layout: with `axis` 1 each group is a contiguous block of
/// columns, with `axis` 0 a contiguous block of rows.
///
/// # Arguments
///
/// * `flowcell_size` - Total number of channels on the flowcell.
/// * `split` - Number of groups; must divide the dimension along `axis`.
/// * `axis` - 0 to split top-bottom, 1 to split left-right.
/// * `odd_even` - Return odd and even channels as two groups, ignoring `split` and `axis`.
///
/// # Returns
/// A list of channel lists.
pub fn generate_flowcell(
    flowcell_size: usize,
    split: usize,
    axis: usize,
    odd_even: bool,
) -> Result<Vec<Vec<u32>>, PipelineError> {
    let flowcell = Flowcell::from_channels(flowcell_size)?;
    let channels = flowcell.channels() as u32;

    if odd_even {
        return Ok(vec![
            (1..=channels).step_by(2).collect(),
            (2..=channels).step_by(2).collect(),
        ]);
    }

    if split == 0 {
        return Err(PipelineError::InvalidConfig("split must be a positive integer".to_string()));
    }
    if axis > 1 {
        return Err(PipelineError::InvalidConfig(format!("axis must be 0 or 1, got {}", axis)));
    }

    let arr = flowcell_array(flowcell_size)?;
    let dimension = arr.len_of(Axis(axis));
    if dimension % split != 0 {
        return Err(PipelineError::UnevenSplit { split, axis, dimension });
    }

    Ok(arr
        .axis_chunks_iter(Axis(axis), dimension / split)
        .map(|block| block.iter().copied().collect())
        .collect())
}
