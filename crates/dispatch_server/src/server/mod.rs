#![forbid(unsafe_code)]

pub mod bridge;
pub mod embedded;
pub mod gate;
pub mod http;
pub mod hub;
pub mod registry;
pub mod signaling;
pub mod standalone;
pub mod token;



#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod signaling_tests;

#[cfg(test)]
mod token_tests;
