pub mod basecall;
pub mod command;
pub mod coverage;
pub mod decisions;
pub mod fastx;
pub mod file;
pub mod flowcell;
pub mod instrument;
pub mod mapping;
pub mod paf;
pub mod signal;
pub mod streams;
pub mod system;
pub mod taxonomy;
