//! Test utilities for `ble-snap`
//!
//! Synthetic fragment streams and an in-memory transport for exercising the
//! reassembly pipeline without a camera board or BLE adapter.

pub mod fragment_generator;
pub mod mock_link;

pub use fragment_generator::*;
pub use mock_link::*;
