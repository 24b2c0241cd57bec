#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod attribution;
pub mod bootstrap;
pub mod config;
pub mod preprocess;
pub mod progress;
pub mod regression;
pub mod strategy;
pub mod types;
#[path = "../shared/io.rs"]
pub mod io;

#[path = "../simulate/mod.rs"]
pub mod simulate;
