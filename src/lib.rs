pub mod utils;

// GPU backends
pub mod collectors;
pub mod energy_poller;

pub mod config;
pub mod cputime;
pub mod log_store;
pub mod regions;
pub mod report;
pub mod run;
pub mod supervisor;
pub mod tdp;
