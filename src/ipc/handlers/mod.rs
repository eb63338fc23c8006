pub mod accounts;
pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod events;
pub mod exams;
pub mod marks;
pub mod payments;
pub mod schedule;
pub mod stats;
pub mod students;
pub mod teachers;

mod assignments;
