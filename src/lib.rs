pub mod batch;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod event;
pub mod export;
pub mod graph;
pub mod handler;
pub mod importer;
pub mod observation;
pub mod publish;
pub mod report;
pub mod source;
pub mod store;
