#![allow(dead_code)]
use std::io::Cursor;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::link::{LinkPort, SerialLink};

const OPCODE_START_UPLOAD: u8 = 0x21;
const OPCODE_FINISH_UPLOAD: u8 = 0x22;
const OPCODE_GET_LAST_STATUS: u8 = 0x23;
const OPCODE_FILE_CHUNK: u8 = 0x24;
const OPCODE_GET_STORAGE_LIST: u8 = 0x27;
const OPCODE_FORMAT_FLASH: u8 = 0x28;
const OPCODE_GET_FILE_INFO: u8 = 0x2A;
const OPCODE_READ_FILE_CHUNK: u8 = 0x2B;
const OPCODE_RAW_STORAGE_READ: u8 = 0x2C;
const OPCODE_RAW_STORAGE_WRITE: u8 = 0x2D;
const OPCODE_ERASE_FILE: u8 = 0x2E;
const OPCODE_GET_VERSION_INFO: u8 = 0x2F;
const OPCODE_RAW_STORAGE_ERASE: u8 = 0x30;
const OPCODE_GET_STORAGE_INFO: u8 = 0x31;
const OPCODE_EXEC_FROM_RAM: u8 = 0x32;
const OPCODE_SWITCH_2_APPS: u8 = 0x33;

/// Clock constant carried by SWITCH_2_APPS.
const APPS_CLOCK: u32 = 26_666_667;

pub const SLFS_BLOCK_SIZE: u32 = 4096;

/// Allocation unit sizes selectable when opening a file for write.
pub const FLASH_BLOCK_SIZES: [u32; 5] = [0x100, 0x400, 0x1000, 0x4000, 0x10000];

// File open flags, from cc3200-sdk/simplelink/include/fs.h.
pub const SLFS_FILE_OPEN_FLAG_COMMIT: u32 = 0x1;
pub const SLFS_FILE_OPEN_FLAG_SECURE: u32 = 0x2;
pub const SLFS_FILE_OPEN_FLAG_NO_SIGNATURE_TEST: u32 = 0x4;
pub const SLFS_FILE_OPEN_FLAG_STATIC: u32 = 0x8;
pub const SLFS_FILE_OPEN_FLAG_VENDOR: u32 = 0x10;
pub const SLFS_FILE_PUBLIC_WRITE: u32 = 0x20;
pub const SLFS_FILE_PUBLIC_READ: u32 = 0x40;

const SLFS_MODE_OPEN_WRITE_CREATE_IF_NOT_EXIST: u32 = 3;

/// Raw transfers are split so a chunk plus its command header fits a
/// single bootloader packet.
const RAW_WRITE_CHUNK: usize = 4080;
const RAW_READ_CHUNK: u32 = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum StorageId {
    Sram = 0x00,
    Sflash = 0x02,
}

/// Version report of the ROM/NWP bootloader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub bootloader: [u8; 4],
    pub nwp: [u8; 4],
    pub mac: [u8; 4],
    pub phy: [u8; 4],
    pub chip_type: [u8; 4],
}

impl VersionInfo {
    pub fn from_packet(data: &[u8]) -> Result<Self>
    {
        if data.len() != 28 {
            return Err(Error::Protocol(format!(
                "version info should be 28 bytes, got {}",
                data.len()
            )));
        }

        let field = |off: usize| -> [u8; 4] {
            [data[off], data[off + 1], data[off + 2], data[off + 3]]
        };

        Ok(Self {
            bootloader: field(0),
            nwp: field(4),
            mac: field(8),
            phy: field(12),
            chip_type: field(16),
        })
    }

    pub fn is_cc3200(&self) -> bool
    {
        self.chip_type[0] & 0x10 != 0
    }
}

/// Bitmask of storage media present on the device.
#[derive(Copy, Clone, Debug)]
pub struct StorageList(pub u8);

impl StorageList {
    pub fn has_flash(&self)  -> bool { self.0 & 0x02 != 0 }
    pub fn has_sflash(&self) -> bool { self.0 & 0x04 != 0 }
    pub fn has_sram(&self)   -> bool { self.0 & 0x80 != 0 }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StorageInfo {
    pub block_size: u16,
    pub block_count: u16,
}

impl StorageInfo {
    pub fn from_packet(data: &[u8]) -> Result<Self>
    {
        let mut rdr = Cursor::new(data);
        let block_size = rdr.read_u16::<BigEndian>()?;
        let block_count = rdr.read_u16::<BigEndian>()?;

        Ok(Self { block_size, block_count })
    }

    pub fn storage_size(&self) -> u32
    {
        self.block_size as u32 * self.block_count as u32
    }
}

/// Device status as reported by GET_LAST_STATUS.
#[derive(Copy, Clone, Debug)]
pub struct Status(pub u8);

impl Status {
    pub fn is_ok(&self) -> bool
    {
        self.0 == 0x40
    }
}

/// Result of a GET_FILE_INFO query.
#[derive(Copy, Clone, Debug)]
pub struct FileInfo {
    pub exists: bool,
    pub size: u32,
}

impl FileInfo {
    pub fn from_packet(data: &[u8]) -> Result<Self>
    {
        if data.len() < 8 {
            return Err(Error::Protocol(format!(
                "file info response too short ({} bytes)",
                data.len()
            )));
        }

        let exists = data[0] == 0x01;
        let size = Cursor::new(&data[4..8]).read_u32::<BigEndian>()?;

        Ok(Self { exists, size })
    }
}

/// Build the 32-bit open flags for START_UPLOAD: access mode in bits
/// 12..16, block-size class in 8..12, block count in 0..8 and the
/// optional SLFS flags in 16..24.
pub fn upload_flags(file_len: u32, fs_flags: Option<u32>) -> Result<u32>
{
    let (bsize_idx, bsize) = FLASH_BLOCK_SIZES
        .iter()
        .enumerate()
        .find(|(_, bsize)| **bsize * 255 >= file_len)
        .map(|(i, bsize)| (i as u32, *bsize))
        .ok_or_else(|| Error::FileTooLarge(format!("no block size fits {} bytes", file_len)))?;

    let blocks = file_len.div_ceil(bsize);

    let mut flags = ((SLFS_MODE_OPEN_WRITE_CREATE_IF_NOT_EXIST & 0x0F) << 12)
        | ((bsize_idx & 0x0F) << 8)
        | (blocks & 0xFF);

    if let Some(fs_flags) = fs_flags {
        flags |= (fs_flags & 0xFF) << 16;
    }

    Ok(flags)
}

fn put_u32(buf: &mut Vec<u8>, value: u32)
{
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Typed request/response wrappers over the framed link.
#[derive(Debug)]
pub struct Bootloader<P> {
    pub(crate) link: SerialLink<P>,
    erase_timeout: Duration,
}

impl<P: LinkPort> Bootloader<P> {
    pub fn new(link: SerialLink<P>, erase_timeout: Duration) -> Self
    {
        Self { link, erase_timeout }
    }

    pub fn get_last_status(&mut self) -> Result<Status>
    {
        self.link.send_packet(&[OPCODE_GET_LAST_STATUS], None)?;
        let status = self.link.recv_packet(None)?;

        if status.is_empty() {
            return Err(Error::Protocol("empty status packet".to_string()));
        }
        log::debug!("get last status got {:02x?}", status);

        Ok(Status(status[0]))
    }

    /// Query the last status and fail with the raw byte when it is not OK.
    pub fn ensure_ok(&mut self) -> Result<()>
    {
        let status = self.get_last_status()?;
        if !status.is_ok() {
            return Err(Error::DeviceStatus(status.0));
        }

        Ok(())
    }

    pub fn get_version(&mut self) -> Result<VersionInfo>
    {
        self.link.send_packet(&[OPCODE_GET_VERSION_INFO], None)?;
        let data = self.link.recv_packet(None)?;

        VersionInfo::from_packet(&data)
    }

    pub fn get_storage_list(&mut self) -> Result<StorageList>
    {
        log::info!("Getting storage list...");
        self.link.send_packet(&[OPCODE_GET_STORAGE_LIST], None)?;

        let byte = self.link.read_raw(1, Some(Duration::from_millis(500)))?;
        if byte.len() != 1 {
            return Err(Error::Protocol("did not receive storage list byte".to_string()));
        }

        Ok(StorageList(byte[0]))
    }

    pub fn get_storage_info(&mut self, storage_id: StorageId) -> Result<StorageInfo>
    {
        log::info!("Getting storage info...");
        let mut command = vec![OPCODE_GET_STORAGE_INFO];
        put_u32(&mut command, storage_id as u32);
        self.link.send_packet(&command, None)?;

        let data = self.link.recv_packet(None)?;
        if data.len() < 4 {
            return Err(Error::Protocol(format!(
                "getting storage info got {} bytes",
                data.len()
            )));
        }
        log::debug!("storage #{} info bytes: {:02x?}", storage_id as u32, data);

        StorageInfo::from_packet(&data)
    }

    /// Refuse a raw transfer when the requested medium is not present.
    fn check_storage(&mut self, storage_id: StorageId) -> Result<()>
    {
        let slist = self.get_storage_list()?;

        if storage_id == StorageId::Sflash && !slist.has_sflash() {
            return Err(Error::Protocol("no serial flash?!".to_string()));
        }
        if storage_id == StorageId::Sram && !slist.has_sram() {
            return Err(Error::Protocol("no sram?!".to_string()));
        }

        Ok(())
    }

    pub fn erase_blocks(&mut self, storage_id: StorageId, start: u32, count: u32) -> Result<()>
    {
        let mut command = vec![OPCODE_RAW_STORAGE_ERASE];
        put_u32(&mut command, storage_id as u32);
        put_u32(&mut command, start);
        put_u32(&mut command, count);

        // Block erasure is slow and flash dependent, hence the wider timeout.
        self.link.send_packet(&command, Some(self.erase_timeout))
    }

    pub fn raw_write(&mut self, storage_id: StorageId, offset: u32, data: &[u8]) -> Result<()>
    {
        self.check_storage(storage_id)?;

        let mut sent = 0;
        while sent < data.len() {
            let chunk = &data[sent..(sent + RAW_WRITE_CHUNK).min(data.len())];

            let mut command = vec![OPCODE_RAW_STORAGE_WRITE];
            put_u32(&mut command, storage_id as u32);
            put_u32(&mut command, offset + sent as u32);
            put_u32(&mut command, chunk.len() as u32);
            command.extend_from_slice(chunk);

            self.link.send_packet(&command, None)?;
            sent += chunk.len();
        }

        Ok(())
    }

    pub fn raw_read(&mut self, storage_id: StorageId, offset: u32, size: u32) -> Result<Vec<u8>>
    {
        self.check_storage(storage_id)?;

        let sinfo = self.get_storage_info(storage_id)?;
        let storage_size = sinfo.storage_size();

        if offset > storage_size {
            return Err(Error::InvalidArgument(format!(
                "offset {} is bigger than available mem {}",
                offset, storage_size
            )));
        }
        if size as u64 + offset as u64 > storage_size as u64 {
            return Err(Error::InvalidArgument(format!(
                "size {} + offset {} is bigger than available mem {}",
                size, offset, storage_size
            )));
        }

        log::info!(
            "Reading raw storage #{} start 0x{:x}, size 0x{:x}...",
            storage_id as u32,
            offset,
            size
        );

        let mut rx_data = Vec::with_capacity(size as usize);
        while (rx_data.len() as u32) < size {
            let toread = RAW_READ_CHUNK.min(size - rx_data.len() as u32);
            let chunk = self.read_chunk(storage_id, offset + rx_data.len() as u32, toread)?;
            rx_data.extend_from_slice(&chunk);
        }

        Ok(rx_data)
    }

    fn read_chunk(&mut self, storage_id: StorageId, offset: u32, size: u32) -> Result<Vec<u8>>
    {
        let mut command = vec![OPCODE_RAW_STORAGE_READ];
        put_u32(&mut command, storage_id as u32);
        put_u32(&mut command, offset);
        put_u32(&mut command, size);
        self.link.send_packet(&command, None)?;

        let data = self.link.recv_packet(None)?;
        if data.len() != size as usize {
            return Err(Error::Protocol(format!(
                "invalid received size: {} vs {}",
                data.len(),
                size
            )));
        }

        Ok(data)
    }

    pub fn exec_from_ram(&mut self) -> Result<()>
    {
        self.link.send_packet(&[OPCODE_EXEC_FROM_RAM], None)
    }

    pub fn switch_to_apps(&mut self) -> Result<()>
    {
        let mut command = vec![OPCODE_SWITCH_2_APPS];
        put_u32(&mut command, APPS_CLOCK);

        self.link.send_packet(&command, None)
    }

    pub fn format_flash(&mut self, size_kib: u32) -> Result<()>
    {
        let mut command = vec![OPCODE_FORMAT_FLASH];
        put_u32(&mut command, 2);
        put_u32(&mut command, size_kib / 4);
        put_u32(&mut command, 0);
        put_u32(&mut command, 0);
        put_u32(&mut command, 2);

        self.link.send_packet(&command, None)?;
        self.ensure_ok()
    }

    pub fn erase_file(&mut self, filename: &str) -> Result<()>
    {
        let mut command = vec![OPCODE_ERASE_FILE];
        put_u32(&mut command, 0);
        command.extend_from_slice(filename.as_bytes());
        command.push(0x00);

        self.link.send_packet(&command, None)?;
        self.ensure_ok()
    }

    pub fn get_file_info(&mut self, filename: &str) -> Result<FileInfo>
    {
        let mut command = vec![OPCODE_GET_FILE_INFO];
        put_u32(&mut command, filename.len() as u32);
        command.extend_from_slice(filename.as_bytes());
        self.link.send_packet(&command, None)?;

        let data = self.link.recv_packet(None)?;
        FileInfo::from_packet(&data)
    }

    pub fn open_file_for_write(
        &mut self,
        filename: &str,
        file_len: u32,
        fs_flags: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<()>
    {
        let flags = upload_flags(file_len, fs_flags)?;
        self.open_file(filename, flags, timeout)
    }

    pub fn open_file_for_read(&mut self, filename: &str) -> Result<()>
    {
        self.open_file(filename, 0, None)
    }

    fn open_file(&mut self, filename: &str, slfs_flags: u32, timeout: Option<Duration>) -> Result<()>
    {
        let mut command = vec![OPCODE_START_UPLOAD];
        put_u32(&mut command, slfs_flags);
        put_u32(&mut command, 0);
        command.extend_from_slice(filename.as_bytes());
        command.extend_from_slice(&[0x00, 0x00]);

        self.link.send_packet(&command, timeout)?;

        // The token is not framed; it follows the ACK directly.
        let token = self.link.read_raw(4, timeout)?;
        if token.len() != 4 {
            return Err(Error::Protocol("no token after file open".to_string()));
        }

        Ok(())
    }

    pub fn close_file(&mut self, signature: Option<&[u8]>) -> Result<()>
    {
        let default_signature = [0x46u8; 256];
        let signature = signature.unwrap_or(&default_signature);
        if signature.len() != 256 {
            return Err(Error::InvalidArgument("bad signature length".to_string()));
        }

        let mut command = vec![OPCODE_FINISH_UPLOAD];
        command.extend_from_slice(&[0x00; 63]);
        command.extend_from_slice(signature);
        command.push(0x00);

        self.link.send_packet(&command, None)?;
        self.ensure_ok()
    }

    pub fn send_file_chunk(&mut self, offset: u32, data: &[u8]) -> Result<()>
    {
        let mut command = vec![OPCODE_FILE_CHUNK];
        put_u32(&mut command, offset);
        command.extend_from_slice(data);

        self.link.send_packet(&command, None)?;
        self.ensure_ok()
    }

    pub fn read_file_chunk(&mut self, offset: u32, size: u32) -> Result<Vec<u8>>
    {
        let mut command = vec![OPCODE_READ_FILE_CHUNK];
        put_u32(&mut command, offset);
        put_u32(&mut command, size);
        self.link.send_packet(&command, None)?;

        let data = self.link.recv_packet(None)?;
        if data.len() != size as usize {
            return Err(Error::Protocol("reading chunk failed".to_string()));
        }

        Ok(data)
    }
}
