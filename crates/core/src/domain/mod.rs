pub mod report;
pub mod symbol;
