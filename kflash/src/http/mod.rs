//! HTTP clients

pub mod moonraker;
