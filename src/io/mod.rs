mod block;
mod diskemu;

pub use block::{SectorId, SectorStorage};
pub use diskemu::{FileSectorEmulator, FileSectorEmulatorBuilder};
