pub mod config;
pub mod generator;
pub mod report;
pub mod run;
