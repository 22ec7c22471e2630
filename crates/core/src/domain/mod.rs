pub mod calendar;
pub mod error;
pub mod extraction;
pub mod job;
pub mod progress;
pub mod settings;
pub mod transcript;
pub mod types;
