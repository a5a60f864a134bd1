pub mod config;
pub mod correlator;
pub mod lifecycle;
pub mod llm;
pub mod messages;
pub mod store;
pub mod terminal;
pub mod transport;
pub mod worker;
