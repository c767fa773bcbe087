use std::cmp::min;
use std::convert::TryInto;
use std::io;

use log::debug;
use thiserror::Error;

use crate::alloc::{Bitmap, State};
use crate::io::{SectorId, SectorStorage};
use crate::SECTOR_SIZE;

/// Width of the on-disk index table. The first `NUM_DIRECT - 1` entries
/// address data sectors; the final entry is the tagged extension slot.
pub const NUM_DIRECT: usize = 30;
const DIRECT_SLOTS: usize = NUM_DIRECT - 1;
/// Entries in the single indirect block: one sector of ids, no header.
pub const INDEX_CAPACITY: usize = SECTOR_SIZE / 4;
/// The most data sectors one inode can address.
pub const MAX_FILE_SECTORS: usize = DIRECT_SLOTS + INDEX_CAPACITY;
/// The largest representable file in bytes.
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// On-disk tag for an extension slot with no indirect block behind it.
const NO_EXTENSION: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not enough free sectors left on the device")]
    InsufficientSpace,
    #[error("file would exceed the direct+indirect addressing bound")]
    CapacityExceeded,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device i/o failure")]
    Io(#[from] io::Error),
}

/// The final slot of the index table: either the whole file fits in the
/// direct slots, or the slot addresses one indirect block of further
/// sector ids. Once indirection is engaged it never reverts.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Extension {
    DirectOnly,
    Indirect(SectorId),
}

type IndexBlock = [SectorId; INDEX_CAPACITY];

/// Describes the sector layout of one file: total valid bytes, the number
/// of data sectors assigned, and the index table addressing them.
///
/// An inode is built by [`Inode::allocate`] for a new file or
/// [`Inode::fetch_from`] for one already on disk, grown in place with
/// [`Inode::append`], and destroyed with [`Inode::deallocate`], which must
/// run before the sector holding the inode itself is reclaimed. Callers
/// serialize access; none of these operations lock anything internally.
pub struct Inode {
    /// Total valid bytes. The last assigned sector need not be full.
    size: u32,
    /// Data sectors currently assigned to the file.
    sectors: u32,
    direct: [SectorId; DIRECT_SLOTS],
    extension: Extension,
}

impl Inode {
    /// Builds a fresh inode for a new file of `size` bytes, claiming every
    /// needed sector from `map` and persisting the indirect block (when one
    /// is needed) through `dev`.
    ///
    /// Both the addressing bound and free-space availability are checked
    /// before the map is touched, so a rejected request claims nothing.
    pub fn allocate<D: SectorStorage>(
        map: &mut Bitmap,
        dev: &mut D,
        size: u32,
    ) -> Result<Self, FsError> {
        let sectors = sectors_for(size);
        if sectors as usize > MAX_FILE_SECTORS {
            return Err(FsError::CapacityExceeded);
        }
        let needs_index = sectors as usize > DIRECT_SLOTS;
        if map.count_free() < sectors as usize + needs_index as usize {
            return Err(FsError::InsufficientSpace);
        }

        let mut direct = [0; DIRECT_SLOTS];
        for slot in direct.iter_mut().take(min(sectors as usize, DIRECT_SLOTS)) {
            *slot = claim(map);
        }
        let extension = if needs_index {
            let index_sector = claim(map);
            let mut index: IndexBlock = [0; INDEX_CAPACITY];
            for entry in index.iter_mut().take(sectors as usize - DIRECT_SLOTS) {
                *entry = claim(map);
            }
            write_index(dev, index_sector, &index)?;
            Extension::Indirect(index_sector)
        } else {
            Extension::DirectOnly
        };

        debug!("allocated {} sectors for a {} byte file", sectors, size);
        Ok(Inode {
            size,
            sectors,
            direct,
            extension,
        })
    }

    /// Grows the file by `extra` bytes. Growth that fits in the unused
    /// tail of the current last sector only bumps the byte length;
    /// otherwise new sectors are claimed, engaging indirection when the
    /// new total crosses the direct slots. A rejected call leaves the
    /// inode and the map exactly as they were.
    pub fn append<D: SectorStorage>(
        &mut self,
        map: &mut Bitmap,
        dev: &mut D,
        extra: u32,
    ) -> Result<(), FsError> {
        if extra == 0 {
            return Err(FsError::InvalidArgument(
                "cannot grow a file by zero bytes".to_string(),
            ));
        }

        let slack = self.sectors * SECTOR_SIZE as u32 - self.size;
        if extra <= slack {
            self.size += extra;
            return Ok(());
        }

        let added = sectors_for(extra - slack);
        let total = self.sectors + added;
        if total as usize > MAX_FILE_SECTORS {
            return Err(FsError::CapacityExceeded);
        }
        let engages_index =
            self.extension == Extension::DirectOnly && total as usize > DIRECT_SLOTS;
        if map.count_free() < added as usize + engages_index as usize {
            return Err(FsError::InsufficientSpace);
        }

        match self.extension {
            Extension::DirectOnly if total as usize <= DIRECT_SLOTS => {
                for slot in self.direct[self.sectors as usize..total as usize].iter_mut() {
                    *slot = claim(map);
                }
            }
            Extension::DirectOnly => {
                // Fill out the remaining direct slots, then hang the
                // overflow off a fresh indirect block.
                for slot in self.direct[self.sectors as usize..].iter_mut() {
                    *slot = claim(map);
                }
                let index_sector = claim(map);
                let mut index: IndexBlock = [0; INDEX_CAPACITY];
                for entry in index.iter_mut().take(total as usize - DIRECT_SLOTS) {
                    *entry = claim(map);
                }
                write_index(dev, index_sector, &index)?;
                self.extension = Extension::Indirect(index_sector);
            }
            Extension::Indirect(index_sector) => {
                let mut index = read_index(dev, index_sector)?;
                let occupied = self.sectors as usize - DIRECT_SLOTS;
                for entry in index[occupied..total as usize - DIRECT_SLOTS].iter_mut() {
                    *entry = claim(map);
                }
                write_index(dev, index_sector, &index)?;
            }
        }

        debug!(
            "grew file from {} to {} bytes ({} -> {} sectors)",
            self.size,
            self.size + extra,
            self.sectors,
            total
        );
        self.size += extra;
        self.sectors = total;
        Ok(())
    }

    /// Releases every sector this inode addresses, including the indirect
    /// block's own sector, back to `map`. Consumes the inode; the sector
    /// holding the inode itself may be reclaimed afterwards.
    ///
    /// The map must still mark every addressed sector used; disagreement
    /// means the index and the map have drifted apart, and panics.
    pub fn deallocate<D: SectorStorage>(self, map: &mut Bitmap, dev: &mut D) -> Result<(), FsError> {
        let sectors = self.sector_list(dev)?;
        for &sector in &sectors {
            assert_eq!(
                map.get(sector),
                State::Used,
                "inode addresses sector {} but the map says it is free",
                sector
            );
            map.release(sector);
        }
        if let Extension::Indirect(index_sector) = self.extension {
            assert_eq!(
                map.get(index_sector),
                State::Used,
                "indirect block sector {} is not marked used",
                index_sector
            );
            map.release(index_sector);
        }

        debug!("released {} data sectors", sectors.len());
        Ok(())
    }

    /// Translates a byte offset within the file to the sector storing it.
    /// Offsets in the indirect range cost one extra device read; nothing
    /// is mutated. Offsets at or past the end of the file are a caller
    /// contract violation.
    pub fn sector_at<D: SectorStorage>(
        &self,
        offset: u32,
        dev: &mut D,
    ) -> Result<SectorId, FsError> {
        assert!(
            offset < self.size,
            "offset {} is beyond the end of a {} byte file",
            offset,
            self.size
        );
        let slot = (offset / SECTOR_SIZE as u32) as usize;
        if slot < DIRECT_SLOTS {
            Ok(self.direct[slot])
        } else {
            match self.extension {
                Extension::Indirect(index_sector) => {
                    let index = read_index(dev, index_sector)?;
                    Ok(index[slot - DIRECT_SLOTS])
                }
                Extension::DirectOnly => unreachable!(
                    "offset within the file but past the direct slots with no indirect block"
                ),
            }
        }
    }

    /// Total valid bytes in the file.
    pub fn len(&self) -> u32 {
        self.size
    }

    /// Data sectors currently assigned to the file.
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    /// Reads an inode back from exactly one sector's worth of bytes; the
    /// mirror of [`serialize`]. A buffer of any other size panics, as does
    /// a structurally impossible header - that is corruption, not a
    /// runtime condition.
    ///
    /// [`serialize`]: Inode::serialize
    pub fn parse(buf: &[u8]) -> Self {
        assert_eq!(
            buf.len(),
            SECTOR_SIZE,
            "an inode occupies exactly one sector"
        );
        let size = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let sectors = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let mut direct = [0; DIRECT_SLOTS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = u32::from_be_bytes(buf[8 + i * 4..12 + i * 4].try_into().unwrap());
        }
        let tag_at = 8 + DIRECT_SLOTS * 4;
        let tag = u32::from_be_bytes(buf[tag_at..tag_at + 4].try_into().unwrap());

        assert!(
            sectors as usize <= MAX_FILE_SECTORS,
            "stored sector count {} exceeds the addressing bound",
            sectors
        );
        assert_eq!(
            tag != NO_EXTENSION,
            sectors as usize > DIRECT_SLOTS,
            "extension tag disagrees with the stored sector count"
        );
        assert!(
            size as usize <= sectors as usize * SECTOR_SIZE,
            "stored byte length {} overruns the {} assigned sectors",
            size,
            sectors
        );

        let extension = if tag == NO_EXTENSION {
            Extension::DirectOnly
        } else {
            Extension::Indirect(tag)
        };
        Inode {
            size,
            sectors,
            direct,
            extension,
        }
    }

    /// Serializes the inode into one sector: byte length, sector count,
    /// the direct slots, and the tagged extension slot, as big-endian
    /// 32-bit fields. This and [`parse`] are the only places the in-memory
    /// and on-disk representations meet.
    ///
    /// [`parse`]: Inode::parse
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(SECTOR_SIZE);
        encoded.extend_from_slice(&self.size.to_be_bytes());
        encoded.extend_from_slice(&self.sectors.to_be_bytes());
        for slot in self.direct.iter() {
            encoded.extend_from_slice(&slot.to_be_bytes());
        }
        let tag = match self.extension {
            Extension::DirectOnly => NO_EXTENSION,
            Extension::Indirect(sector) => sector,
        };
        encoded.extend_from_slice(&tag.to_be_bytes());
        encoded
    }

    /// Loads a persisted inode from the given sector.
    pub fn fetch_from<D: SectorStorage>(dev: &mut D, sector: SectorId) -> Result<Self, FsError> {
        let mut buf = [0u8; SECTOR_SIZE];
        dev.read_sector(sector, &mut buf)?;
        Ok(Inode::parse(&buf))
    }

    /// Writes the inode back to the given sector.
    pub fn write_back<D: SectorStorage>(
        &self,
        dev: &mut D,
        sector: SectorId,
    ) -> Result<(), FsError> {
        dev.write_sector(sector, &self.serialize())?;
        Ok(())
    }

    /// Renders the byte length, the resolved sector list in offset order,
    /// and exactly `len()` bytes of file content: printable characters
    /// verbatim, anything else as a two-digit hex escape. Read-only; only
    /// device and writer errors surface.
    pub fn dump<D: SectorStorage, W: io::Write>(
        &self,
        dev: &mut D,
        out: &mut W,
    ) -> Result<(), FsError> {
        let sectors = self.sector_list(dev)?;
        write!(out, "Inode contents. File size: {}. File sectors:", self.size)?;
        for sector in &sectors {
            write!(out, " {}", sector)?;
        }
        writeln!(out)?;
        writeln!(out, "File contents:")?;

        let mut remaining = self.size as usize;
        let mut data = [0u8; SECTOR_SIZE];
        for &sector in &sectors {
            dev.read_sector(sector, &mut data)?;
            let valid = min(remaining, SECTOR_SIZE);
            for &byte in &data[0..valid] {
                if (0x20..=0x7e).contains(&byte) {
                    write!(out, "{}", byte as char)?;
                } else {
                    write!(out, "\\{:02x}", byte)?;
                }
            }
            writeln!(out)?;
            remaining -= valid;
        }
        Ok(())
    }

    /// Every data sector the inode addresses, in offset order, expanding
    /// through the indirect block when one is engaged.
    fn sector_list<D: SectorStorage>(&self, dev: &mut D) -> Result<Vec<SectorId>, FsError> {
        let mut sectors = self.direct[0..min(self.sectors as usize, DIRECT_SLOTS)].to_vec();
        if let Extension::Indirect(index_sector) = self.extension {
            let index = read_index(dev, index_sector)?;
            sectors.extend_from_slice(&index[0..self.sectors as usize - DIRECT_SLOTS]);
        }
        Ok(sectors)
    }
}

fn sectors_for(bytes: u32) -> u32 {
    (bytes + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
}

fn claim(map: &mut Bitmap) -> SectorId {
    // count_free is checked before the first claim of every operation, so
    // running dry mid-operation means the map and the pre-check disagree.
    map.find_free()
        .expect("free-sector map exhausted after availability check")
}

fn read_index<D: SectorStorage>(dev: &mut D, sector: SectorId) -> Result<IndexBlock, FsError> {
    let mut buf = [0u8; SECTOR_SIZE];
    dev.read_sector(sector, &mut buf)?;
    let mut index = [0; INDEX_CAPACITY];
    for (i, entry) in index.iter_mut().enumerate() {
        *entry = u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    }
    Ok(index)
}

fn write_index<D: SectorStorage>(
    dev: &mut D,
    sector: SectorId,
    index: &IndexBlock,
) -> Result<(), FsError> {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, entry) in index.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&entry.to_be_bytes());
    }
    dev.write_sector(sector, &buf)?;
    Ok(())
}
