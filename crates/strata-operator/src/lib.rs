//! Strata operator process: command line and probe endpoints

pub mod cli;
pub mod health;
