pub mod build_info;
pub mod catch;
pub mod cli;
pub mod config;
pub mod event;
pub mod maintenance;
pub mod probe;
pub mod reaper;
pub mod runner;
pub mod stack;
pub mod watchdog;
