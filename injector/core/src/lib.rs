#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
pub mod patch;
pub mod snapshot;

pub use self::{
    config::InjectionConfig,
    patch::PatchOperation,
    snapshot::ConfigSnapshot,
};
