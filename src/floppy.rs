//! Read-only floppy device (spec.md §3, §4.G): an opened byte stream plus a
//! geometry inferred from its size.

use crate::error::{EmulatorError, Result};
use log::{debug, trace};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const BYTES_PER_SECTOR: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
    pub heads: u32,
}

fn geometry_for_size(size: u64) -> Result<Geometry> {
    let g = |sectors_per_track, heads| Geometry { sectors_per_track, bytes_per_sector: BYTES_PER_SECTOR, heads };
    let geometry = match size {
        163_840 => g(8, 1),
        184_320 => g(9, 1),
        368_640 => g(9, 2),
        1_228_800 => g(15, 2),
        1_474_560 => g(18, 2),
        other => {
            debug!("rejecting image of unknown size {other}");
            return Err(EmulatorError::UnknownDiskFormat(other));
        }
    };
    trace!("inferred geometry {geometry:?} from image size {size}");
    Ok(geometry)
}

pub struct Floppy {
    file: File,
    geometry: Geometry,
}

impl Floppy {
    pub fn insert(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let geometry = geometry_for_size(size)?;
        Ok(Floppy { file, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_bootable(&mut self) -> Result<bool> {
        let mut signature = [0u8; 2];
        self.file.seek(SeekFrom::Start(510))?;
        self.file.read_exact(&mut signature)?;
        Ok(signature == [0x55, 0xAA])
    }

    pub fn read_linear(&mut self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    /// Read `count` consecutive sectors starting at `(cylinder, head,
    /// sector)` (sector numbers are 1-based, per the BIOS convention).
    pub fn read_chs(&mut self, cylinder: u32, head: u32, sector: u32, count: u32, dst: &mut [u8]) -> Result<()> {
        let linear_sector = (cylinder * self.geometry.heads + head) * self.geometry.sectors_per_track + (sector - 1);
        let offset = linear_sector as u64 * self.geometry.bytes_per_sector as u64;
        let bytes = count as usize * self.geometry.bytes_per_sector as usize;
        self.read_linear(offset, &mut dst[..bytes])
    }

    pub fn read_boot_sector(&mut self) -> Result<[u8; 512]> {
        let mut buf = [0u8; 512];
        self.read_linear(0, &mut buf)?;
        Ok(buf)
    }

    pub fn eject(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image_of(size: usize, signature_at_510: bool) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = vec![0u8; size];
        if signature_at_510 && size >= 512 {
            bytes[510] = 0x55;
            bytes[511] = 0xAA;
        }
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn geometry_is_inferred_from_known_sizes() {
        let f = image_of(368_640, true);
        let floppy = Floppy::insert(f.path()).unwrap();
        assert_eq!(floppy.geometry(), Geometry { sectors_per_track: 9, bytes_per_sector: 512, heads: 2 });
    }

    #[test]
    fn unknown_size_is_rejected() {
        let f = image_of(12345, false);
        assert_eq!(Floppy::insert(f.path()), Err(EmulatorError::UnknownDiskFormat(12345)));
    }

    #[test]
    fn bootable_signature_is_detected() {
        let f = image_of(163_840, true);
        let mut floppy = Floppy::insert(f.path()).unwrap();
        assert!(floppy.is_bootable().unwrap());
    }

    #[test]
    fn missing_signature_is_not_bootable() {
        let f = image_of(163_840, false);
        let mut floppy = Floppy::insert(f.path()).unwrap();
        assert!(!floppy.is_bootable().unwrap());
    }

    #[test]
    fn chs_read_matches_linear_offset() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = vec![0u8; 368_640];
        bytes[512] = 0xAB; // start of linear sector 1 (cyl 0, head 0, sector 2)
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();
        let mut floppy = Floppy::insert(f.path()).unwrap();
        let mut dst = [0u8; 512];
        floppy.read_chs(0, 0, 2, 1, &mut dst).unwrap();
        assert_eq!(dst[0], 0xAB);
    }
}
