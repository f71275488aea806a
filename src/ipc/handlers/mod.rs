pub mod academic_years;
pub mod backup;
pub mod catalog;
pub mod core;
pub mod exports;
pub mod letters;
pub mod reports;
pub mod rules;
pub mod setup;
pub mod students;
