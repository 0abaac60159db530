//! Scenario-based tests for consortium-pipeline

mod end_to_end;
mod listeners;
mod queue_ordering;
mod shared_database;
