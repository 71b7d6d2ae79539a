pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod gdc;
pub mod index;
pub mod output;
pub mod pipeline;
pub mod reducer;
pub mod retry;
pub mod search;
pub mod store;
