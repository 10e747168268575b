//! Commodore Agnus OCS — beam counter, DMA controller, copper, and blitter.
//!
//! Agnus is the master DMA controller in the Original Chip Set (OCS). It owns
//! the system bus during DMA slots, generates the beam position counters, and
//! contains the copper coprocessor and the interlock the blitter needs into
//! that bus.

mod agnus;
mod collab;
mod config;
mod copper;
mod das_table;
mod dma_table;
mod scheduler;
mod snapshot;

pub use agnus::{Agnus, BusOwner, RegisterSource};
pub use collab::{BlitterOps, ChipRam, CiaOps, Collaborators, DeniseOps, PaulaOps};
pub use config::{AgnusConfig, AgnusModel};
pub use copper::{Copper, Outcome as CopperOutcome, State as CopperState};
pub use dma_table::SLOTS_PER_LINE;
pub use snapshot::{SnapshotError, load, save};
