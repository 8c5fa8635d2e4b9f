//! Mail synchronization pipeline

pub mod archive;
pub mod classifier;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod fetcher;
