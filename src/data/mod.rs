//! Data structures for the analysis pipeline

mod count_matrix;
mod dataset;
mod metadata;

pub use count_matrix::CountMatrix;
pub use dataset::ZinbDataSet;
pub use metadata::CellMetadata;
