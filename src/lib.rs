pub mod catalog;
pub mod config;
pub mod decode;
pub mod health;
pub mod listen;
pub mod migrate;
pub mod model;
pub mod pipeline;
pub mod reduce;
pub mod store;
