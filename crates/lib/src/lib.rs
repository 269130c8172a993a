//! layerforge-lib: Core types and logic for layerforge
//!
//! This crate provides the build-layer pipeline behind `layerforge`:
//! - `Recipe`: ordered build steps evaluated from a Lua recipe file
//! - `LayerStore`: content-addressed, write-once layer cache
//! - `Pipeline`: resolves a base and runs steps, reusing cached layers
//! - `ImageRecord`: the published image and its launch configuration

pub mod consts;
pub mod gc;
pub mod image;
pub mod layer;
pub mod pipeline;
pub mod placeholder;
pub mod platform;
pub mod recipe;
pub mod registry;
pub mod requirements;
pub mod runtime_env;
pub mod steps;
pub mod store_lock;
pub mod util;
