//! strata CLI - build container images from a build file.

pub mod commands;
pub mod output;
