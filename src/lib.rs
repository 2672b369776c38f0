pub mod app;
pub mod ase_map;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod manifest;
pub mod output;
pub mod scan;
pub mod stage;
pub mod tsv;
pub mod world;
