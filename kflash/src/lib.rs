//! kflash Library
//!
//! Core modules for building and flashing Klipper firmware to
//! USB-connected MCU boards.

pub mod discovery;
pub mod errors;
pub mod exec;
pub mod flash;
pub mod http;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
pub mod version;
