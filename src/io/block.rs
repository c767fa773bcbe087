use std::path::Path;

/// The sector number to access, ranging from 0 (the first sector) to n - 1
/// (the last sector) where n is the number of sectors available. Sector
/// ids are 32 bits wide because that is how they are stored in the on-disk
/// index tables.
pub type SectorId = u32;

/// The synchronous device contract consumed by the indexing layer: a read
/// or write does not return until the transfer completes, and the device
/// itself queues concurrent callers. There is no retry layer here; retry
/// policy belongs to the device or an outer reliability layer.
pub trait SectorStorage {
    /// Opens a disk at the specified path. This method does not validate
    /// the stored sectors, it is up to clients to ensure disks are
    /// appropriately initialized.
    fn open_disk<P: AsRef<Path>>(path: P, nsectors: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Reads the given sector into the provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a sector out of range will return an error.
    fn read_sector(&mut self, sector: SectorId, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes the provided buffer into the specified sector.
    ///
    /// # Errors
    ///
    /// Attempting to write a sector out of range will return an error.
    fn write_sector(&mut self, sector: SectorId, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must be
    /// guaranteed the disk writes actually occurred, for instance, if being
    /// re-read from disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
