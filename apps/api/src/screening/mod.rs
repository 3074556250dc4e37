pub mod audit;
pub mod batch;
pub mod collector;
pub mod executor;
pub mod handlers;
pub mod llm_scorer;
pub mod matching;
pub mod pg_store;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod scorer;
pub mod service;
pub mod store;
pub mod weights;
