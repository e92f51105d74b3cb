pub use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use tera::Tera;

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod oracle;
pub mod paths;
pub mod plan;
pub mod report;
pub mod search;

lazy_static! {
    pub static ref TEMPLATES: Tera =
        match Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/*")) {
            Ok(t) => t,
            Err(e) => panic!("Error parsing templates: {e}"),
        };
}

#[cfg(test)]
pub(crate) mod tests;
