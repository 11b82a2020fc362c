pub mod assessments;
pub mod backup;
pub mod core;
pub mod scores;
