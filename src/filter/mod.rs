//! Optional filtering ahead of the multiple-testing adjustment

mod independent;

pub use independent::{independent_filtering, FilteredAdjustment};
