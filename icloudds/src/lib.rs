pub mod config;
pub mod lockfile;
pub mod logging;
pub mod sync;
