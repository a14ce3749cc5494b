//! runlet executes GitHub-Actions-style workflow jobs locally, with
//! containerised isolation per job and an environment contract that mimics
//! the hosted runner closely enough for off-the-shelf actions to behave
//! identically.

pub mod common;
pub mod container;
pub mod expressions;
pub mod git;
pub mod logging;
pub mod runner;
pub mod workflow;
