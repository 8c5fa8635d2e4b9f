//! LLM-backed thread enrichment

pub mod llm;
pub mod schema;
pub mod worker;
