use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bootloader::{Bootloader, StorageId, StorageInfo, SLFS_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::link::LinkPort;

/// Raw access to a storage medium, either through the live bootloader
/// or an offline image file. Higher layers are parameterized by this
/// capability instead of branching on the connection kind.
pub trait RawStorage {
    fn storage_info(&mut self, storage_id: StorageId) -> Result<StorageInfo>;
    fn raw_read(&mut self, storage_id: StorageId, offset: u32, size: u32) -> Result<Vec<u8>>;
    fn raw_write(&mut self, storage_id: StorageId, offset: u32, data: &[u8]) -> Result<()>;
    fn erase_blocks(&mut self, storage_id: StorageId, start: u32, count: u32) -> Result<()>;
}

impl<P: LinkPort> RawStorage for Bootloader<P> {
    fn storage_info(&mut self, storage_id: StorageId) -> Result<StorageInfo>
    {
        Bootloader::get_storage_info(self, storage_id)
    }

    fn raw_read(&mut self, storage_id: StorageId, offset: u32, size: u32) -> Result<Vec<u8>>
    {
        Bootloader::raw_read(self, storage_id, offset, size)
    }

    fn raw_write(&mut self, storage_id: StorageId, offset: u32, data: &[u8]) -> Result<()>
    {
        Bootloader::raw_write(self, storage_id, offset, data)
    }

    fn erase_blocks(&mut self, storage_id: StorageId, start: u32, count: u32) -> Result<()>
    {
        Bootloader::erase_blocks(self, storage_id, start, count)
    }
}

/// A flat SFLASH dump on the local disk, standing in for the device.
#[derive(Debug)]
pub struct ImageStore {
    input: File,
    output: Option<File>,
}

impl ImageStore {
    /// Open the input image read-only and, when given, the output image
    /// read-write (truncated, then usually seeded from the input).
    pub fn open(input: &Path, output: Option<&Path>) -> Result<Self>
    {
        let input = OpenOptions::new().read(true).open(input)?;

        let output = match output {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?,
            ),
            None => None,
        };

        Ok(Self { input, output })
    }

    pub fn has_output(&self) -> bool
    {
        self.output.is_some()
    }

    /// Seed the output image with a byte-for-byte copy of the input.
    pub fn copy_input_to_output(&mut self) -> Result<()>
    {
        let output = match &mut self.output {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut data = Vec::new();
        self.input.seek(SeekFrom::Start(0))?;
        self.input.read_to_end(&mut data)?;

        output.seek(SeekFrom::Start(0))?;
        output.write_all(&data)?;
        output.flush()?;

        Ok(())
    }

    fn image_len(&self) -> Result<u64>
    {
        Ok(self.input.metadata()?.len())
    }
}

impl RawStorage for ImageStore {
    /// Geometry derived from the image: 4 KiB blocks over the whole file.
    fn storage_info(&mut self, _storage_id: StorageId) -> Result<StorageInfo>
    {
        let block_count = (self.image_len()? / SLFS_BLOCK_SIZE as u64) as u16;

        Ok(StorageInfo {
            block_size: SLFS_BLOCK_SIZE as u16,
            block_count,
        })
    }

    /// Reads past the end of the image come back short, matching what a
    /// plain file read would do.
    fn raw_read(&mut self, _storage_id: StorageId, offset: u32, size: u32) -> Result<Vec<u8>>
    {
        self.input.seek(SeekFrom::Start(offset as u64))?;

        let mut data = Vec::with_capacity(size as usize);
        std::io::Read::by_ref(&mut self.input)
            .take(size as u64)
            .read_to_end(&mut data)?;

        Ok(data)
    }

    fn raw_write(&mut self, _storage_id: StorageId, offset: u32, data: &[u8]) -> Result<()>
    {
        let output = match &mut self.output {
            Some(f) => f,
            None => {
                return Err(Error::InvalidArgument(
                    "writing requires an output image file".to_string(),
                ))
            }
        };

        output.seek(SeekFrom::Start(offset as u64))?;
        output.write_all(data)?;
        output.flush()?;

        Ok(())
    }

    fn erase_blocks(&mut self, _storage_id: StorageId, _start: u32, _count: u32) -> Result<()>
    {
        Err(Error::InvalidArgument(
            "block erase requires a serial connection".to_string(),
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn image_with(data: &[u8]) -> tempfile::NamedTempFile
    {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn geometry_follows_image_size()
    {
        let img = image_with(&vec![0xFF; 8 * 4096]);
        let mut store = ImageStore::open(img.path(), None).unwrap();

        let sinfo = store.storage_info(StorageId::Sflash).unwrap();
        assert_eq!(sinfo.block_size, 4096);
        assert_eq!(sinfo.block_count, 8);
    }

    #[test]
    fn reads_are_positioned_and_eof_tolerant()
    {
        let mut data = vec![0u8; 1024];
        data[100] = 0x42;
        let img = image_with(&data);
        let mut store = ImageStore::open(img.path(), None).unwrap();

        let got = store.raw_read(StorageId::Sflash, 100, 4).unwrap();
        assert_eq!(got, vec![0x42, 0, 0, 0]);

        // Short read past the end, like the metadata-2 over-read does.
        let got = store.raw_read(StorageId::Sflash, 1000, 100).unwrap();
        assert_eq!(got.len(), 24);
    }

    #[test]
    fn writes_require_an_output_image()
    {
        let img = image_with(&[0u8; 64]);
        let mut store = ImageStore::open(img.path(), None).unwrap();

        match store.raw_write(StorageId::Sflash, 0, &[1, 2, 3]) {
            Err(Error::InvalidArgument(_)) => (),
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn output_is_seeded_then_patched_in_place()
    {
        let img = image_with(&[0x11u8; 64]);
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut store = ImageStore::open(img.path(), Some(out.path())).unwrap();

        store.copy_input_to_output().unwrap();
        store.raw_write(StorageId::Sflash, 8, &[0xAA, 0xBB]).unwrap();

        let written = std::fs::read(out.path()).unwrap();
        assert_eq!(written.len(), 64);
        assert_eq!(&written[..8], &[0x11; 8]);
        assert_eq!(&written[8..10], &[0xAA, 0xBB]);
        assert_eq!(&written[10..], &[0x11; 54]);
    }
}
