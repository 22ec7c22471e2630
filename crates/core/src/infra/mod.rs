pub mod audio;
pub mod calendar;
pub mod extraction_validator;
pub mod extractor;
pub mod metrics;
pub mod query_parser;
pub mod storage;
pub mod stt;
