//! Dockyard CLI - build, publish and retention management for container images.

pub mod commands;
pub mod output;
