use crate::io::block::{SectorId, SectorStorage};
use crate::SECTOR_SIZE;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

pub struct FileSectorEmulator {
    /// The file must be a fixed-size file some exact multiple of the size
    /// of a sector.
    fd: File,
    /// The total number of sectors available in the store.
    sector_count: usize,
}

/// Emulates sector disk/flash storage in userspace using a file as the
/// backing medium. This is only meant to be used for file system
/// development and testing.
impl FileSectorEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl SectorStorage for FileSectorEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nsectors: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return an error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        let emu = FileSectorEmulator {
            fd: file,
            sector_count: nsectors,
        };

        Ok(emu)
    }

    fn read_sector(&mut self, sector: SectorId, buf: &mut [u8]) -> std::io::Result<()> {
        if sector as usize > (self.sector_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "sector out of range",
            ));
        }

        if buf.len() < SECTOR_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read sector",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((sector as usize * SECTOR_SIZE) as u64))?;
        self.fd.read_exact(&mut buf[0..SECTOR_SIZE])?;
        Ok(())
    }

    /// This method truncates writes that exceed the sector size.
    fn write_sector(&mut self, sector: SectorId, buf: &[u8]) -> std::io::Result<()> {
        if sector as usize > (self.sector_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "sector out of range",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((sector as usize * SECTOR_SIZE) as u64))?;

        let max = if SECTOR_SIZE < buf.len() {
            SECTOR_SIZE
        } else {
            buf.len()
        };
        let bytes_written = self.fd.write(&buf[0..max])?;
        debug_assert!(bytes_written == max);
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileSectorEmulatorBuilder {
    fd: File,
    sector_count: usize,
    clear_medium: bool,
}

impl From<File> for FileSectorEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileSectorEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded
            // down to the nearest sector.
            sector_count: 0,
            clear_medium: true,
        }
    }
}

impl FileSectorEmulatorBuilder {
    /// Sets the number of desired sectors in the emulated device.
    pub fn with_sector_count(mut self, sectors: usize) -> Self {
        self.sector_count = sectors;
        self
    }

    /// Controls whether the backing file is zeroed out during build. Pass
    /// `false` to reopen an already-formatted medium without wiping it.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally,
    /// ownership of the file is transferred to the emulator meaning this
    /// builder can only be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileSectorEmulator> {
        debug_assert!(self.sector_count > 0);
        if self.clear_medium {
            self.zero_medium()?;
        }
        Ok(FileSectorEmulator {
            fd: self.fd,
            sector_count: self.sector_count,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" sectors, buffering each write to prevent
        // excessive syscalls.
        for _ in 0..self.sector_count {
            bfd.write_all(vec![0x00; SECTOR_SIZE].as_slice())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(16)
            .build()
            .expect("failed to allocate sector file");
        disk_emu.sync_disk().unwrap();
        assert_eq!(
            disk_emu.into_file().metadata().unwrap().len(),
            (16 * SECTOR_SIZE) as u64
        );
    }

    #[test]
    fn can_read_and_write_sectors() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(4)
            .build()
            .expect("failed to allocate sector file");
        disk_emu.sync_disk().unwrap();

        // Fill a sector with a non-zero character.
        let sector = vec![0x55; SECTOR_SIZE];
        disk_emu.write_sector(2, sector.as_slice()).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_sector = vec![0x00; SECTOR_SIZE];
        // Read a different sector.
        disk_emu.read_sector(3, read_sector.as_mut_slice()).unwrap();
        assert_eq!(read_sector, vec![0x00; SECTOR_SIZE]);

        // Read the sector with data.
        let mut filled_sector = vec![0x00; SECTOR_SIZE];
        disk_emu
            .read_sector(2, filled_sector.as_mut_slice())
            .unwrap();
        assert_eq!(filled_sector, vec![0x55; SECTOR_SIZE]);
    }

    #[test]
    fn read_sector_beyond_range_returns_error() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(1)
            .build()
            .expect("failed to allocate sector file");
        disk_emu.sync_disk().unwrap();

        // Attempt to write beyond range.
        let sector = vec![0x55; SECTOR_SIZE];
        let wresult = disk_emu.write_sector(1, sector.as_slice());
        if wresult.is_ok() {
            panic!("expected an error, got result instead")
        }
    }

    #[test]
    fn writing_less_than_a_full_sector_succeeds() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(1)
            .build()
            .expect("failed to allocate sector file");
        disk_emu.sync_disk().unwrap();

        // Fill half the sector with meaningful data.
        let sector = vec![0x55; SECTOR_SIZE / 2];
        disk_emu
            .write_sector(0, sector.as_slice())
            .expect("failed to write sector");
        disk_emu.sync_disk().unwrap();
    }

    #[test]
    fn reopening_without_clearing_preserves_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(4)
            .build()
            .unwrap();
        let sector = vec![0x2a; SECTOR_SIZE];
        disk_emu.write_sector(1, sector.as_slice()).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut reopened = FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(4)
            .clear_medium(false)
            .build()
            .unwrap();
        let mut read_sector = vec![0x00; SECTOR_SIZE];
        reopened.read_sector(1, read_sector.as_mut_slice()).unwrap();
        assert_eq!(read_sector, vec![0x2a; SECTOR_SIZE]);
    }
}
