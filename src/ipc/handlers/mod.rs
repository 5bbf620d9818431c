pub mod core;
pub mod exams;
pub mod grades;
pub mod ranking;
pub mod students;
pub mod summary;
pub mod terms;
