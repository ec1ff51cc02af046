pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod graph;
pub mod indexer;
pub mod mcp;
pub mod model;
pub mod risk;
pub mod tools;
