pub mod bootstrap;
pub mod job_registry;
pub mod meeting_service;
pub mod orchestrator;
pub mod reconciler;
