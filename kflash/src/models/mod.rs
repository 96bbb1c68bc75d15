//! Data contracts shared across modules

pub mod device;
pub mod outcome;

pub use device::{DeviceProfile, DiscoveredDevice, GlobalConfig, PrintStatus};
pub use outcome::{
    BatchReport, FlashMethod, FlashResult, OutcomeKind, Phase, PhaseContext, PhaseOutcome,
    RunStatus, Verification,
};
