pub mod storage;
pub mod submission;
