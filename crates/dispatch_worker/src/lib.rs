#![forbid(unsafe_code)]

pub mod config;
pub mod health;
pub mod lock;
pub mod runner;
pub mod tasks;

#[cfg(test)]
mod lock_tests;

#[cfg(test)]
mod runner_tests;
