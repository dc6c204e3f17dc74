pub mod admission;
pub mod aggregate;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fetch;
pub mod grid;
pub mod mediawiki;
pub mod migrate;
pub mod model;
pub mod runtime;
pub mod store;
pub mod timeslice;
pub mod update;
