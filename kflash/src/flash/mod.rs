//! Flash orchestration engine

pub mod batch;
pub mod build;
pub mod cancel;
pub mod config_check;
pub mod gates;
pub mod orchestrator;
pub mod poll;
pub mod service;
pub mod strategy;
pub mod verify;
