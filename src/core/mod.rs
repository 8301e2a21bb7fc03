// src/core/mod.rs

pub mod args;
pub mod command_parser;
pub mod config;
pub mod context;
pub mod env_manager;
pub mod envfile;
pub mod graph;
pub mod orchestrator;
pub mod tasks;
pub mod template;
