pub mod errors;
pub mod filelock;
pub mod logger;
pub mod psutils;
