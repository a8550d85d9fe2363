pub mod records;
pub mod sequences;
