use bincode::{DefaultOptions, Options};
use clap::ArgEnum;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::bootloader::StorageInfo;
use crate::error::{Error, Result};

pub const SFFS_HEADER_SIGNATURE: u16 = 0x534C;

/// First 8 bytes of every file's payload region.
pub const FILE_HEADER_SIZE: u32 = 8;

/// Offset of the second FAT copy's metadata relative to the first.
pub const FAT_PART_OFFSET: u32 = 0x1000;

pub const METADATA2_LENGTH: u32 = 0x1000;

/// FAT plus metadata occupy the first blocks of the flash.
const RESERVED_BLOCKS: u32 = 5;

/// TI's doc: "Total number of files is limited to 128 files, including
/// system and configuration files"
const FAT_SLOTS: usize = 128;

/// Device family, deciding which metadata offsets apply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum DeviceKind {
    #[clap(name = "cc3200")]
    Cc3200,
    #[clap(name = "cc32xx")]
    Cc32xx,
}

impl DeviceKind {
    pub fn metadata2_offset(self) -> u32
    {
        match self {
            DeviceKind::Cc3200 => 0x774,
            DeviceKind::Cc32xx => 0x2000,
        }
    }

    fn fname_array_offset(self) -> usize
    {
        match self {
            DeviceKind::Cc3200 => 0x200,
            DeviceKind::Cc32xx => 0x3C0,
        }
    }
}

fn bincode_opt() -> impl Options
{
    DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Leading fields of a FAT copy.
#[derive(Clone, Copy, Debug, Deserialize)]
struct FatHeaderRaw {
    fat_commit_revision: u16,
    header_signature: u16,
}

/// One 4-byte file record in the FAT slot table.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct SlotRecord {
    index: u8,
    size_blocks: u8,
    start_block_lsb: u8,
    flags_sb_msb: u8,
}

/// Filename descriptor in metadata block 2.
#[derive(Clone, Copy, Debug, Deserialize)]
struct Meta2Desc {
    fname_offset: u16,
    fname_len: u16,
}

/// A validated FAT copy.
///
/// The two copies on media have no fixed primary/secondary role; they
/// are written interchangeably and the one stamped with the larger
/// commit revision is the live table. After a successful commit the
/// older copy is sometimes, but not always, wiped to 0xFF.
#[derive(Clone, Debug)]
pub struct FatHeader {
    pub index: usize,
    pub fat_commit_revision: u16,
    pub fat_bytes: Vec<u8>,
}

impl FatHeader {
    /// Basic validation of one FAT copy. Returns `None` for an empty or
    /// unsigned copy; full parsing happens later on the selected one.
    pub fn parse(index: usize, fat_bytes: &[u8], block_size: u16) -> Result<Option<Self>>
    {
        if fat_bytes.len() != block_size as usize {
            return Err(Error::CorruptFat("incorrect FAT size".to_string()));
        }

        let raw: FatHeaderRaw = bincode_opt()
            .deserialize(&fat_bytes[..4])
            .map_err(|e| Error::CorruptFat(e.to_string()))?;

        if raw.fat_commit_revision == 0xFFFF || raw.header_signature == 0xFFFF {
            // empty FAT
            return Ok(None);
        }

        if raw.header_signature != SFFS_HEADER_SIGNATURE {
            log::warn!(
                "broken FAT: (invalid header signature: 0x{:08x}, 0x{:08x})",
                raw.fat_commit_revision,
                raw.header_signature
            );
            return Ok(None);
        }

        log::info!("[{}] detected a valid FAT revision: {}", index, raw.fat_commit_revision);

        Ok(Some(Self {
            index,
            fat_commit_revision: raw.fat_commit_revision,
            fat_bytes: fat_bytes.to_vec(),
        }))
    }
}

/// Pick the active (or inactive) copy: the greater commit revision wins,
/// ties go to the first copy.
pub fn select_fat(
    hdr1: Option<FatHeader>,
    hdr2: Option<FatHeader>,
    inactive: bool,
) -> Result<FatHeader>
{
    let mut headers: Vec<FatHeader> = [hdr1, hdr2].into_iter().flatten().collect();

    if headers.is_empty() {
        return Err(Error::CorruptFat("no valid fat tables found".to_string()));
    }

    headers.sort_by(|a, b| b.fat_commit_revision.cmp(&a.fat_commit_revision));

    let picked = if inactive {
        if headers.len() < 2 {
            return Err(Error::CorruptFat("no valid inactive fat table found".to_string()));
        }
        headers.swap_remove(1)
    } else {
        headers.swap_remove(0)
    };

    log::info!(
        "selected FAT revision: {} ({})",
        picked.fat_commit_revision,
        if inactive { "inactive" } else { "active" }
    );

    Ok(picked)
}

/// The 8-byte header at the start of a file's payload region, fetched
/// lazily for extended listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Header {
    Absent,
    Parsed { length: u32, magic: [u8; 5] },
}

/// One file in the FAT.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub index: u8,
    pub start_block: u16,
    pub size_blocks: u8,
    pub mirrored: bool,
    pub flags: u8,
    pub fname: String,
    pub total_blocks: u32,
    pub header: Header,
}

impl FileEntry {
    /// Attach the on-flash file header; ignored unless exactly 8 bytes.
    pub fn set_header(&mut self, bytes: &[u8])
    {
        if bytes.len() != FILE_HEADER_SIZE as usize {
            return;
        }

        let length = (bytes[0] as u32) | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16;
        let magic = [bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]];

        self.header = Header::Parsed { length, magic };
    }

    /// Logical file length from the header, 0 when not fetched.
    pub fn size(&self) -> u32
    {
        match &self.header {
            Header::Absent => 0,
            Header::Parsed { length, .. } => *length,
        }
    }

    pub fn magic_hex(&self) -> Option<String>
    {
        match &self.header {
            Header::Absent => None,
            Header::Parsed { magic, .. } => {
                Some(magic.iter().map(|b| format!("{:02x}", b)).collect())
            }
        }
    }
}

impl Serialize for FileEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    {
        let mut s = serializer.serialize_struct("FileEntry", 9)?;
        s.serialize_field("index", &self.index)?;
        s.serialize_field("start_block", &self.start_block)?;
        s.serialize_field("size_blocks", &self.size_blocks)?;
        s.serialize_field("mirrored", &self.mirrored)?;
        s.serialize_field("flags", &self.flags)?;
        s.serialize_field("fname", &self.fname)?;
        s.serialize_field("total_blocks", &self.total_blocks)?;
        s.serialize_field("size", &self.size())?;
        s.serialize_field("magic", &self.magic_hex())?;
        s.end()
    }
}

/// A run of free blocks between files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Hole {
    pub start_block: u16,
    pub size_blocks: u16,
}

/// The selected FAT, fully decoded.
#[derive(Clone, Debug, Serialize)]
pub struct SffsInfo {
    pub fat_commit_revision: u16,
    pub block_size: u16,
    pub block_count: u16,
    pub used_blocks: u32,
    pub files: Vec<FileEntry>,
    pub holes: Vec<Hole>,
}

impl SffsInfo {
    /// Decode the 128-slot table of the given FAT copy. Purely
    /// in-memory; the FAT and metadata bytes must already be read.
    pub fn parse(
        fat: &FatHeader,
        sinfo: &StorageInfo,
        meta2: &[u8],
        device: DeviceKind,
    ) -> Result<Self>
    {
        let fname_array_offset = device.fname_array_offset();

        let mut files = Vec::new();
        let mut used_blocks = RESERVED_BLOCKS;
        let mut snippets: Vec<(u32, u32)> = vec![(0, RESERVED_BLOCKS)];

        for i in 0..FAT_SLOTS {
            let meta = fat
                .fat_bytes
                .get((i + 1) * 4..(i + 2) * 4)
                .ok_or_else(|| Error::CorruptFat("FAT table truncated".to_string()))?;

            if meta == &[0xFF, 0xFF, 0xFF, 0xFF] || meta == &[0xFF, i as u8, 0xFF, 0x7F] {
                // empty slot in the middle of the table
                continue;
            }

            let record: SlotRecord = bincode_opt()
                .deserialize(meta)
                .map_err(|e| Error::CorruptFat(e.to_string()))?;

            if record.index as usize != i {
                return Err(Error::CorruptFat(format!(
                    "incorrect FAT entry (index {} != {})",
                    record.index, i
                )));
            }

            // The exact boundary between 'start block MSB' and 'flags'
            // inside the fourth byte is only partly understood. 0x8 is
            // set on everything but /sys/mcuimg.bin, 0x4 is the negated
            // mirrored/commit option, and 4 bits of MSB are enough to
            // address 16 MB worth of 4K blocks.
            let flags = record.flags_sb_msb >> 4;
            let start_block_msb = (record.flags_sb_msb & 0x0F) as u16;
            let start_block = (start_block_msb << 8) | record.start_block_lsb as u16;
            let mirrored = flags & 0x4 == 0;

            let total_blocks = if mirrored {
                record.size_blocks as u32 * 2
            } else {
                record.size_blocks as u32
            };

            let desc_bytes = meta2
                .get(i * 4..(i + 1) * 4)
                .ok_or_else(|| Error::CorruptFat("metadata block 2 too short".to_string()))?;
            let desc: Meta2Desc = bincode_opt()
                .deserialize(desc_bytes)
                .map_err(|e| Error::CorruptFat(e.to_string()))?;

            let fo_abs = fname_array_offset + desc.fname_offset as usize;
            let fname_bytes = meta2
                .get(fo_abs..fo_abs + desc.fname_len as usize)
                .ok_or_else(|| Error::CorruptFat("file name out of metadata bounds".to_string()))?;
            let fname = std::str::from_utf8(fname_bytes)
                .ok()
                .filter(|s| s.is_ascii())
                .ok_or_else(|| Error::CorruptFat("file name is not ASCII".to_string()))?
                .to_string();

            snippets.push((start_block as u32, total_blocks));
            used_blocks += total_blocks;

            files.push(FileEntry {
                index: i as u8,
                start_block,
                size_blocks: record.size_blocks,
                mirrored,
                flags,
                fname,
                total_blocks,
                header: Header::Absent,
            });
        }

        // Trailing sentinel so the sweep also emits the final hole.
        snippets.push((sinfo.block_count as u32, 0));
        snippets.sort_by_key(|s| s.0);

        let mut holes = Vec::new();
        let mut prev_end = 0u32;
        for (start, len) in snippets {
            if start < prev_end {
                for f in &files {
                    log::info!(
                        "[{}] block {}..{} fname={}",
                        f.index,
                        f.start_block,
                        f.start_block as u32 + f.total_blocks,
                        f.fname
                    );
                }
                return Err(Error::CorruptFat(format!(
                    "overlapping entry at block {} (prev end was {})",
                    start, prev_end
                )));
            }
            if start > prev_end {
                holes.push(Hole {
                    start_block: prev_end as u16,
                    size_blocks: (start - prev_end - 1) as u16,
                });
            }
            prev_end = start + len;
        }

        Ok(Self {
            fat_commit_revision: fat.fat_commit_revision,
            block_size: sinfo.block_size,
            block_count: sinfo.block_count,
            used_blocks,
            files,
            holes,
        })
    }

    pub fn find_file(&self, fname: &str, file_id: i64) -> Option<&FileEntry>
    {
        self.files.iter().find(|f| {
            if file_id == -1 {
                f.fname == fname
            } else {
                f.index as i64 == file_id
            }
        })
    }

    pub fn print_info(&self, extended: bool)
    {
        log::info!("Serial Flash block size:\t{} bytes", self.block_size);
        log::info!("Serial Flash capacity:\t{} blocks", self.block_count);
        log::info!("");

        if extended {
            log::info!("\tfile\tstart\tsize\tsize\tfail\tflags\ttotal\tmagic\t\tfilename");
            log::info!("\tindex\tblock\t[BLKs]\t[bytes]\tsafe\t\t[BLKs]");
            log::info!("{}", "-".repeat(97));
            log::info!("\tN/A\t0\t5\tN/A\tN/A\t5\tN/A\tN/A\t\tFATFS");
        } else {
            log::info!("\tfile\tstart\tsize\tfail\tflags\ttotal\tfilename");
            log::info!("\tindex\tblock\t[BLKs]\tsafe\t[BLKs]");
            log::info!("{}", "-".repeat(76));
            log::info!("\tN/A\t0\t5\tN/A\tN/A\t5\tFATFS");
        }

        for f in &self.files {
            let failsafe = if f.mirrored { "yes" } else { "no" };
            if extended {
                log::info!(
                    "\t{}\t{}\t{}\t{}\t{}\t0x{:x}\t{}\t{}\t{}",
                    f.index,
                    f.start_block,
                    f.size_blocks,
                    f.size(),
                    failsafe,
                    f.flags,
                    f.total_blocks,
                    f.magic_hex().unwrap_or_default(),
                    f.fname
                );
            } else {
                log::info!(
                    "\t{}\t{}\t{}\t{}\t0x{:x}\t{}\t{}",
                    f.index,
                    f.start_block,
                    f.size_blocks,
                    failsafe,
                    f.flags,
                    f.total_blocks,
                    f.fname
                );
            }
        }

        log::info!("");
        log::info!("   Flash usage");
        log::info!("-------------------------");
        log::info!("used space:\t{} blocks", self.used_blocks);
        log::info!(
            "free space:\t{} blocks",
            self.block_count as u32 - self.used_blocks
        );

        for h in &self.holes {
            log::info!(
                "memory hole:\t[{}-{}]",
                h.start_block,
                h.start_block + h.size_blocks
            );
        }
    }

    pub fn print_short(&self)
    {
        log::info!(
            "FAT r{}, num files: {}, used/free blocks: {}/{}",
            self.fat_commit_revision,
            self.files.len(),
            self.used_blocks,
            self.block_count as u32 - self.used_blocks
        );
    }

    pub fn print_json(&self) -> Result<()>
    {
        let json = serde_json::to_string(self)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        println!("{}", json);

        Ok(())
    }
}
