#![forbid(unsafe_code)]

pub mod dad;
