pub mod bench;
pub mod iteralign;
