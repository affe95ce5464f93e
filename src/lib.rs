pub mod adapters;
pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod decoders;
pub mod indexer;
pub mod rpc;
