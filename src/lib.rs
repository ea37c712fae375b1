pub mod app;
pub mod domain;
pub mod error;
pub mod export;
pub mod platform;
pub mod report;
pub mod resolve;
pub mod scan;
pub mod snapshot;
