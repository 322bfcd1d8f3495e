#![warn(missing_docs)]

//! DedupVault command line front end

pub mod cli;
pub mod config;
