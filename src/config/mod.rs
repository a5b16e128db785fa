pub mod conditions;
pub mod defs;
