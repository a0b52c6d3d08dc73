pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod images;
pub mod inat;
pub mod labelstudio;
pub mod output;
pub mod sampler;
pub mod store;
pub mod sync;
