#![forbid(unsafe_code)]

pub mod pipeline;
#[cfg(test)]
mod pipeline_tests;
pub mod runtime;
pub mod status_http;
