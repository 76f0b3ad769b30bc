use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

use crate::bootloader::{
    FileInfo, StorageId, SLFS_BLOCK_SIZE, SLFS_FILE_OPEN_FLAG_COMMIT, SLFS_FILE_OPEN_FLAG_SECURE,
    SLFS_FILE_PUBLIC_WRITE,
};
use crate::error::{Error, Result};
use crate::link::LinkPort;
use crate::session::Session;
use crate::sffs::{
    self, DeviceKind, FatHeader, Header, SffsInfo, FAT_PART_OFFSET, FILE_HEADER_SIZE,
    METADATA2_LENGTH,
};
use crate::storage::{ImageStore, RawStorage};

/// Options attached to a single `write_file` invocation.
#[derive(Clone, Debug)]
pub struct WriteOptions {
    pub signature: Option<PathBuf>,
    pub file_size: u32,
    pub commit: bool,
    pub file_id: i64,
}

impl Default for WriteOptions {
    fn default() -> Self
    {
        Self {
            signature: None,
            file_size: 0,
            commit: false,
            file_id: -1,
        }
    }
}

enum Target<P> {
    Live(Session<P>),
    Image(ImageStore),
}

/// High-level file operations over either a live device or an offline
/// image pair.
pub struct FsOps<P> {
    target: Target<P>,
    device: DeviceKind,
}

impl<P: LinkPort> FsOps<P> {
    pub fn live(session: Session<P>, device: DeviceKind) -> Self
    {
        Self {
            target: Target::Live(session),
            device,
        }
    }

    pub fn offline(store: ImageStore, device: DeviceKind) -> Self
    {
        Self {
            target: Target::Image(store),
            device,
        }
    }

    pub fn is_live(&self) -> bool
    {
        matches!(self.target, Target::Live(_))
    }

    fn raw(&mut self) -> &mut dyn RawStorage
    {
        match &mut self.target {
            Target::Live(session) => &mut session.boot,
            Target::Image(store) => store,
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session<P>>
    {
        match &mut self.target {
            Target::Live(session) => Ok(session),
            Target::Image(_) => Err(Error::InvalidArgument(
                "this operation requires a serial connection".to_string(),
            )),
        }
    }

    pub fn begin_command(&mut self) -> Result<()>
    {
        match &mut self.target {
            Target::Live(session) => session.begin_command(),
            Target::Image(_) => Ok(()),
        }
    }

    pub fn finish_command(&mut self)
    {
        if let Target::Live(session) = &mut self.target {
            session.finish_command();
        }
    }

    /// Read both FAT copies and decode the selected one.
    pub fn get_fat_info(&mut self, inactive: bool, extended: bool) -> Result<SffsInfo>
    {
        let sinfo = self.raw().storage_info(StorageId::Sflash)?;
        let block_size = sinfo.block_size as u32;

        let fat = self
            .raw()
            .raw_read(StorageId::Sflash, 0, 2 * block_size)?;

        let hdr1 = FatHeader::parse(
            0,
            fat.get(..block_size as usize).unwrap_or(&[]),
            sinfo.block_size,
        )?;
        let hdr2 = FatHeader::parse(
            1,
            fat.get(block_size as usize..2 * block_size as usize)
                .unwrap_or(&[]),
            sinfo.block_size,
        )?;

        let mut metadata2_offset = self.device.metadata2_offset();
        if hdr2.is_some() {
            metadata2_offset += FAT_PART_OFFSET;
        }

        // TODO: confirm against hardware whether the metadata read really
        // wants offset + length as its size; shipped image fixtures
        // depend on the over-read.
        let meta2 = self.raw().raw_read(
            StorageId::Sflash,
            metadata2_offset,
            metadata2_offset + METADATA2_LENGTH,
        )?;

        let fat_hdr = sffs::select_fat(hdr1, hdr2, inactive)?;
        let mut info = SffsInfo::parse(&fat_hdr, &sinfo, &meta2, self.device)?;

        if extended {
            for f in &mut info.files {
                let offset = f.start_block as u32 * block_size;
                let header = match &mut self.target {
                    Target::Live(session) => {
                        session
                            .boot
                            .raw_read(StorageId::Sflash, offset, FILE_HEADER_SIZE)?
                    }
                    Target::Image(store) => {
                        store.raw_read(StorageId::Sflash, offset, FILE_HEADER_SIZE)?
                    }
                };
                f.set_header(&header);
            }
        }

        Ok(info)
    }

    pub fn list_filesystem(
        &mut self,
        json_output: bool,
        inactive: bool,
        extended: bool,
    ) -> anyhow::Result<()>
    {
        let info = self.get_fat_info(inactive, extended)?;
        info.print_info(extended);

        if json_output {
            info.print_json()?;
        }

        Ok(())
    }

    pub fn format_slfs(&mut self, size_kib: u32) -> anyhow::Result<()>
    {
        log::info!("Formatting flash with size={}", size_kib);

        let session = self.session_mut()?;
        session.boot.format_flash(size_kib).context("format failed")?;

        Ok(())
    }

    pub fn get_file_info(&mut self, filename: &str, file_id: i64) -> Result<FileInfo>
    {
        if self.is_live() && file_id == -1 {
            return self.session_mut()?.boot.get_file_info(filename);
        }

        let fat_info = self.get_fat_info(false, false)?;

        Ok(match fat_info.find_file(filename, file_id) {
            Some(f) => FileInfo {
                exists: true,
                size: f.size_blocks as u32 * SLFS_BLOCK_SIZE,
            },
            None => FileInfo {
                exists: false,
                size: 0,
            },
        })
    }

    pub fn erase_file(&mut self, filename: &str, force: bool) -> anyhow::Result<()>
    {
        if !force {
            let finfo = self.get_file_info(filename, -1)?;
            if !finfo.exists {
                log::warn!("File '{}' does not exist, won't erase", filename);
                return Ok(());
            }
        }

        log::info!("Erasing file {}...", filename);
        let session = self.session_mut()?;
        session
            .boot
            .erase_file(filename)
            .with_context(|| format!("erasing file {} failed", filename))?;

        Ok(())
    }

    pub fn write_file(
        &mut self,
        local_path: &Path,
        cc_filename: &str,
        opts: &WriteOptions,
    ) -> anyhow::Result<()>
    {
        let file_data = fs::read(local_path)
            .with_context(|| format!("cannot read {}", local_path.display()))?;

        if file_data.is_empty() {
            log::warn!("Won't upload empty file");
            return Ok(());
        }

        let mut fs_flags = None;
        if opts.commit {
            fs_flags = Some(SLFS_FILE_OPEN_FLAG_COMMIT);
        }

        let mut sign_data = None;
        if let Some(sig_path) = &opts.signature {
            let mut sig = fs::read(sig_path)
                .with_context(|| format!("cannot read {}", sig_path.display()))?;
            sig.truncate(256);
            sign_data = Some(sig);

            fs_flags = Some(
                SLFS_FILE_OPEN_FLAG_COMMIT | SLFS_FILE_OPEN_FLAG_SECURE | SLFS_FILE_PUBLIC_WRITE,
            );
        }

        let use_api = match &self.target {
            Target::Live(_) => true,
            Target::Image(store) if store.has_output() => false,
            Target::Image(_) => {
                return Err(Error::InvalidArgument(
                    "writing through the file API requires a serial connection; \
                     supply an output image file to patch in place"
                        .to_string(),
                )
                .into())
            }
        };

        if use_api {
            self.write_file_api(
                local_path,
                cc_filename,
                sign_data.as_deref(),
                fs_flags,
                opts.file_size,
                &file_data,
            )
        } else {
            self.write_file_raw(
                local_path,
                cc_filename,
                opts.file_id,
                fs_flags,
                opts.file_size,
                &file_data,
            )
        }
    }

    /// Default strategy on a live device: erase, open through the file
    /// API, stream chunks, finalize with the signature.
    fn write_file_api(
        &mut self,
        local_path: &Path,
        cc_filename: &str,
        sign_data: Option<&[u8]>,
        fs_flags: Option<u32>,
        size: u32,
        file_data: &[u8],
    ) -> anyhow::Result<()>
    {
        let finfo = self.get_file_info(cc_filename, -1)?;
        if finfo.exists {
            log::info!("File exists on target, erasing");
            self.erase_file(cc_filename, false)?;
        }

        let file_len = file_data.len() as u32;
        let alloc_size = size.max(file_len);
        let mut alloc_size_effective = alloc_size;
        if fs_flags.map_or(false, |f| f & SLFS_FILE_OPEN_FLAG_COMMIT != 0) {
            alloc_size_effective *= 2;
        }

        let session = self.session_mut()?;

        let mut timeout = session.boot.link.port_timeout();
        if alloc_size_effective > 200_000 {
            // Empirically ~252925 bytes fit a 5 second timeout.
            let widened = 5.0 * (alloc_size_effective as f64 / 200_000.0 + 1.0);
            timeout = timeout.max(Duration::from_secs_f64(widened));
        }

        log::info!(
            "Uploading file {} -> {} [{}, disk={}]...",
            local_path.display(),
            cc_filename,
            alloc_size,
            alloc_size_effective
        );

        session
            .boot
            .open_file_for_write(cc_filename, alloc_size, fs_flags, Some(timeout))?;

        let mut pos = 0u32;
        for chunk in file_data.chunks(SLFS_BLOCK_SIZE as usize) {
            session
                .boot
                .send_file_chunk(pos, chunk)
                .with_context(|| format!("writing at pos {} failed", pos))?;
            pos += chunk.len() as u32;
            eprint!(".");
        }
        eprintln!();

        log::debug!("Closing file ...");
        session.boot.close_file(sign_data).context("closing file failed")?;

        Ok(())
    }

    /// Offline strategy: patch the payload region of an existing file
    /// in place, rewriting its 8-byte header but never the FAT.
    fn write_file_raw(
        &mut self,
        local_path: &Path,
        cc_filename: &str,
        file_id: i64,
        fs_flags: Option<u32>,
        size: u32,
        file_data: &[u8],
    ) -> anyhow::Result<()>
    {
        let fat_info = self.get_fat_info(false, true)?;
        let entry = fat_info.find_file(cc_filename, file_id).ok_or_else(|| {
            Error::FileNotFound(format!(
                "{} or id {} not found, but only overwriting is supported",
                cc_filename, file_id
            ))
        })?;

        let block_size = fat_info.block_size as u32;
        let file_len = file_data.len() as u32;

        let alloc_size = size.max(file_len) + FILE_HEADER_SIZE;
        let blocks = alloc_size.div_ceil(block_size);
        let mut alloc_size_effective = alloc_size;
        if fs_flags.map_or(false, |f| f & SLFS_FILE_OPEN_FLAG_COMMIT != 0) {
            alloc_size_effective *= 2;
        }

        if blocks > entry.size_blocks as u32 {
            let max_size = entry.size_blocks as u32 * block_size + FILE_HEADER_SIZE;
            return Err(Error::FileTooLarge(format!(
                "{} is too big, it should not be bigger than {} bytes",
                local_path.display(),
                max_size
            ))
            .into());
        }

        log::info!(
            "Uploading file {} -> {} ({}) [{}, disk={}]...",
            local_path.display(),
            cc_filename,
            entry.index,
            alloc_size,
            alloc_size_effective
        );

        let magic = match &entry.header {
            Header::Parsed { magic, .. } => *magic,
            Header::Absent => {
                return Err(Error::CorruptFat(
                    "file header in flash is missing or has the wrong size".to_string(),
                )
                .into())
            }
        };

        let fatfs_offset = entry.start_block as u32 * block_size;

        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        header[0] = (file_len & 0xFF) as u8;
        header[1] = ((file_len >> 8) & 0xFF) as u8;
        header[2] = ((file_len >> 16) & 0xFF) as u8;
        header[3..].copy_from_slice(&magic);

        self.raw().raw_write(StorageId::Sflash, fatfs_offset, &header)?;
        self.raw()
            .raw_write(StorageId::Sflash, fatfs_offset + FILE_HEADER_SIZE, file_data)?;

        Ok(())
    }

    pub fn read_file(
        &mut self,
        cc_fname: &str,
        local_path: &Path,
        file_id: i64,
    ) -> anyhow::Result<()>
    {
        let finfo = self.get_file_info(cc_fname, file_id)?;
        if !finfo.exists {
            return Err(Error::FileNotFound(format!("{} does not exist on target", cc_fname)).into());
        }

        log::info!("Reading file {} -> {}", cc_fname, local_path.display());
        let mut local = File::create(local_path)
            .with_context(|| format!("cannot create {}", local_path.display()))?;

        if self.is_live() && file_id == -1 {
            let session = self.session_mut()?;
            session.boot.open_file_for_read(cc_fname)?;

            let mut pos = 0u32;
            while pos < finfo.size {
                let toread = (finfo.size - pos).min(SLFS_BLOCK_SIZE);
                let data = session.boot.read_file_chunk(pos, toread)?;
                local.write_all(&data)?;
                pos += toread;
            }

            session.boot.close_file(None)?;
            return Ok(());
        }

        let fat_info = self.get_fat_info(false, true)?;
        let entry = fat_info
            .find_file(cc_fname, file_id)
            .ok_or_else(|| Error::FileNotFound(cc_fname.to_string()))?;

        let block_size = fat_info.block_size as u32;
        let offset = entry.start_block as u32 * block_size + FILE_HEADER_SIZE;
        let size = entry.size_blocks as u32 * block_size;

        // The allocation tail may butt against the end of the flash;
        // clamp so the skipped header bytes do not push the read past it.
        let sinfo = self.raw().storage_info(StorageId::Sflash)?;
        let size = size.min(sinfo.storage_size().saturating_sub(offset));

        let data = self.raw().raw_read(StorageId::Sflash, offset, size)?;
        local.write_all(&data)?;

        Ok(())
    }

    /// Write a complete Gang image. The first 8 bytes go last; a
    /// partially written image must not expose a valid header.
    pub fn write_flash(&mut self, image_path: &Path, erase: bool) -> anyhow::Result<()>
    {
        let data = fs::read(image_path)
            .with_context(|| format!("cannot read {}", image_path.display()))?;

        if erase {
            let count = (data.len() as u32).div_ceil(SLFS_BLOCK_SIZE);
            self.raw().erase_blocks(StorageId::Sflash, 0, count)?;
        }

        if data.len() > FILE_HEADER_SIZE as usize {
            self.raw().raw_write(
                StorageId::Sflash,
                FILE_HEADER_SIZE,
                &data[FILE_HEADER_SIZE as usize..],
            )?;
        }

        let head_len = data.len().min(FILE_HEADER_SIZE as usize);
        self.raw().raw_write(StorageId::Sflash, 0, &data[..head_len])?;

        Ok(())
    }

    pub fn read_flash(&mut self, dump_path: &Path, offset: i64, size: i64) -> anyhow::Result<()>
    {
        let sinfo = self.raw().storage_info(StorageId::Sflash)?;
        let storage_size = sinfo.storage_size() as i64;

        if offset < 0 || offset > storage_size {
            return Err(Error::InvalidArgument(format!(
                "offset {} is bigger than available mem {}",
                offset, storage_size
            ))
            .into());
        }

        let size = if size < 1 {
            let max = storage_size - offset;
            log::info!("Setting raw read size to maximum: {}", max);
            max
        } else {
            size
        };

        if size + offset > storage_size {
            return Err(Error::InvalidArgument(format!(
                "size {} + offset {} is bigger than available mem {}",
                size, offset, storage_size
            ))
            .into());
        }

        let data = self
            .raw()
            .raw_read(StorageId::Sflash, offset as u32, size as u32)?;

        let mut dump = File::create(dump_path)
            .with_context(|| format!("cannot create {}", dump_path.display()))?;
        dump.write_all(&data)?;

        Ok(())
    }

    pub fn read_all_files(&mut self, local_dir: &Path, by_file_id: bool) -> anyhow::Result<()>
    {
        let fat_info = self.get_fat_info(false, false)?;
        fat_info.print_info(false);

        let files: Vec<(i64, String)> = fat_info
            .files
            .iter()
            .map(|f| (f.index as i64, f.fname.clone()))
            .collect();

        for (index, fname) in files {
            let by_id = by_file_id && fname.is_empty();
            let ccname = if by_id { index.to_string() } else { fname.clone() };

            let relative = ccname.strip_prefix('/').unwrap_or(&ccname).to_string();
            let target = local_dir.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }

            let file_id = if by_id { index } else { -1 };
            if let Err(e) = self.read_file(&ccname, &target, file_id) {
                log::error!("File {} could not be read, {:#}", fname, e);
            }
        }

        Ok(())
    }

    pub fn write_all_files(&mut self, local_dir: &Path, simulate: bool) -> anyhow::Result<()>
    {
        let mut paths = Vec::new();
        collect_files(local_dir, &mut paths)
            .with_context(|| format!("cannot walk {}", local_dir.display()))?;
        paths.sort();

        for path in paths {
            let relative = path
                .strip_prefix(local_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let ccpath = format!("/{}", relative.trim_start_matches('/'));

            if simulate {
                log::info!(
                    "Simulation: Would copy local file {} to cc3200 {}",
                    path.display(),
                    ccpath
                );
            } else {
                self.write_file(&path, &ccpath, &WriteOptions::default())?;
            }
        }

        Ok(())
    }

    pub fn reboot_to_app(&mut self) -> anyhow::Result<()>
    {
        match &mut self.target {
            Target::Live(session) => Ok(session.reboot_to_app()?),
            Target::Image(_) => {
                log::warn!("reboot_to_app needs a serial connection, skipping");
                Ok(())
            }
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()>
{
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::Bootloader;
    use crate::link::testing::{split_tx_frames, ScriptedPort};
    use crate::link::SerialLink;
    use crate::session::{PinConfig, Session};
    use crate::sffs::SFFS_HEADER_SIGNATURE;
    use std::io::Write as _;

    fn kind(err: &anyhow::Error) -> &Error
    {
        err.downcast_ref::<Error>().expect("typed error")
    }

    /// 8-block cc3200 image: one valid FAT (revision 1), an erased
    /// second copy, and a 512-byte `/cfg` occupying 2 blocks at block 5.
    fn build_image() -> Vec<u8>
    {
        let mut img = vec![0xFFu8; 8 * 4096];

        img[0..2].copy_from_slice(&1u16.to_le_bytes());
        img[2..4].copy_from_slice(&SFFS_HEADER_SIGNATURE.to_le_bytes());
        // slot 0: size 2 blocks, start block 5, flags 0xC (not mirrored)
        img[4..8].copy_from_slice(&[0x00, 0x02, 0x05, 0xC0]);

        // metadata block 2: descriptor for slot 0, name at array offset 0
        img[0x774..0x776].copy_from_slice(&0u16.to_le_bytes());
        img[0x776..0x778].copy_from_slice(&4u16.to_le_bytes());
        img[0x974..0x978].copy_from_slice(b"/cfg");

        // file header + payload
        img[0x5000..0x5008].copy_from_slice(&[0x00, 0x02, 0x00, 0x4C, 0x53, 0xAA, 0xBB, 0xCC]);
        for b in &mut img[0x5008..0x5008 + 512] {
            *b = 0x11;
        }

        img
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile
    {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    fn offline_ops(
        input: &tempfile::NamedTempFile,
        output: Option<&tempfile::NamedTempFile>,
    ) -> FsOps<ScriptedPort>
    {
        let mut store = ImageStore::open(input.path(), output.map(|o| o.path())).unwrap();
        store.copy_input_to_output().unwrap();
        FsOps::offline(store, DeviceKind::Cc3200)
    }

    fn live_ops(port: ScriptedPort) -> FsOps<ScriptedPort>
    {
        let boot = Bootloader::new(SerialLink::new(port), Duration::from_secs(120));
        let session = Session::new(
            boot,
            PinConfig::parse("none", true).unwrap(),
            PinConfig::parse("none", false).unwrap(),
        );
        FsOps::live(session, DeviceKind::Cc3200)
    }

    fn live_tx(ops: &mut FsOps<ScriptedPort>) -> Vec<Vec<u8>>
    {
        match &mut ops.target {
            Target::Live(session) => split_tx_frames(&session.boot.link.port.tx),
            Target::Image(_) => unreachable!(),
        }
    }

    mod offline {
        use super::*;

        #[test]
        fn listing_decodes_the_image()
        {
            let input = write_temp(&build_image());
            let mut ops = offline_ops(&input, None);

            let info = ops.get_fat_info(false, true).unwrap();
            assert_eq!(info.block_count, 8);
            assert_eq!(info.used_blocks, 7);
            assert_eq!(info.files.len(), 1);

            let f = &info.files[0];
            assert_eq!(f.fname, "/cfg");
            assert_eq!(f.start_block, 5);
            assert_eq!(f.size_blocks, 2);
            assert!(!f.mirrored);
            assert_eq!(f.size(), 512);
            assert_eq!(f.magic_hex().unwrap(), "4c53aabbcc");
        }

        #[test]
        fn raw_overwrite_patches_header_and_payload_only()
        {
            let image = build_image();
            let input = write_temp(&image);
            let output = write_temp(&[]);
            let replacement = write_temp(&vec![0x22u8; 300]);
            let mut ops = offline_ops(&input, Some(&output));

            ops.write_file(replacement.path(), "/cfg", &WriteOptions::default())
                .unwrap();

            let patched = std::fs::read(output.path()).unwrap();
            assert_eq!(patched.len(), image.len());

            // 24-bit length rewritten, magic preserved.
            assert_eq!(&patched[0x5000..0x5003], &[0x2C, 0x01, 0x00]);
            assert_eq!(&patched[0x5003..0x5008], &image[0x5003..0x5008]);
            // New payload, then untouched bytes.
            assert!(patched[0x5008..0x5008 + 300].iter().all(|b| *b == 0x22));
            assert_eq!(&patched[0x5008 + 300..], &image[0x5008 + 300..]);
            // The FAT and everything up to the file region are
            // byte-identical.
            assert_eq!(&patched[..0x5000], &image[..0x5000]);
        }

        #[test]
        fn raw_overwrite_refuses_to_grow_the_file()
        {
            let input = write_temp(&build_image());
            let output = write_temp(&[]);

            // ceil((8185 + 8) / 4096) = 3 > 2 allocated blocks.
            let too_big = write_temp(&vec![0u8; 8185]);
            let mut ops = offline_ops(&input, Some(&output));
            let err = ops
                .write_file(too_big.path(), "/cfg", &WriteOptions::default())
                .unwrap_err();
            match kind(&err) {
                Error::FileTooLarge(_) => (),
                other => panic!("expected FileTooLarge, got {:?}", other),
            }

            // 8184 + 8 bytes exactly fill both blocks.
            let exact = write_temp(&vec![0u8; 8184]);
            let mut ops = offline_ops(&input, Some(&output));
            ops.write_file(exact.path(), "/cfg", &WriteOptions::default())
                .unwrap();
        }

        #[test]
        fn raw_overwrite_requires_an_existing_entry()
        {
            let input = write_temp(&build_image());
            let output = write_temp(&[]);
            let data = write_temp(&[1, 2, 3]);
            let mut ops = offline_ops(&input, Some(&output));

            let err = ops
                .write_file(data.path(), "/missing", &WriteOptions::default())
                .unwrap_err();
            match kind(&err) {
                Error::FileNotFound(_) => (),
                other => panic!("expected FileNotFound, got {:?}", other),
            }
        }

        #[test]
        fn read_file_resolves_by_name_and_by_id()
        {
            let input = write_temp(&build_image());
            let out_by_name = tempfile::NamedTempFile::new().unwrap();
            let out_by_id = tempfile::NamedTempFile::new().unwrap();
            let mut ops = offline_ops(&input, None);

            ops.read_file("/cfg", out_by_name.path(), -1).unwrap();
            ops.read_file("ignored", out_by_id.path(), 0).unwrap();

            let by_name = std::fs::read(out_by_name.path()).unwrap();
            let by_id = std::fs::read(out_by_id.path()).unwrap();
            assert_eq!(by_name, by_id);
            // Whole allocation, header skipped.
            assert_eq!(by_name.len(), 2 * 4096);
            assert!(by_name[..512].iter().all(|b| *b == 0x11));
            assert!(by_name[512..].iter().all(|b| *b == 0xFF));
        }

        #[test]
        fn read_flash_defaults_to_the_whole_image()
        {
            let image = build_image();
            let input = write_temp(&image);
            let dump = tempfile::NamedTempFile::new().unwrap();
            let mut ops = offline_ops(&input, None);

            ops.read_flash(dump.path(), 0, -1).unwrap();
            assert_eq!(std::fs::read(dump.path()).unwrap(), image);
        }

        #[test]
        fn erase_of_a_missing_file_warns_and_succeeds()
        {
            let input = write_temp(&build_image());
            let mut ops = offline_ops(&input, None);

            ops.erase_file("/missing", false).unwrap();
        }

        #[test]
        fn api_only_commands_refuse_to_run_offline()
        {
            let input = write_temp(&build_image());
            let mut ops = offline_ops(&input, None);

            let err = ops.format_slfs(1024).unwrap_err();
            match kind(&err) {
                Error::InvalidArgument(_) => (),
                other => panic!("expected InvalidArgument, got {:?}", other),
            }

            let err = ops.erase_file("/cfg", false).unwrap_err();
            match kind(&err) {
                Error::InvalidArgument(_) => (),
                other => panic!("expected InvalidArgument, got {:?}", other),
            }
        }

        #[test]
        fn simulate_walks_without_writing()
        {
            let input = write_temp(&build_image());
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("sys")).unwrap();
            std::fs::write(dir.path().join("sys/mcuimg.bin"), b"firmware").unwrap();
            let mut ops = offline_ops(&input, None);

            ops.write_all_files(dir.path(), true).unwrap();
        }
    }

    mod live {
        use super::*;

        #[test]
        fn gang_write_erases_then_saves_the_header_for_last()
        {
            let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
            let image = write_temp(&data);

            let mut port = ScriptedPort::new();
            port.feed_ack(); // erase
            port.feed_ack(); // storage list for body write
            port.feed(&[0x04]);
            port.feed_ack(); // three body chunks
            port.feed_ack();
            port.feed_ack();
            port.feed_ack(); // storage list for header write
            port.feed(&[0x04]);
            port.feed_ack(); // header chunk
            let mut ops = live_ops(port);

            ops.write_flash(image.path(), true).unwrap();

            let frames = live_tx(&mut ops);
            assert_eq!(frames.len(), 7);

            // Erase covers ceil(10000 / 4096) = 3 blocks.
            assert_eq!(frames[0][0], 0x30);
            assert_eq!(&frames[0][9..13], &3u32.to_be_bytes());

            assert_eq!(frames[1], vec![0x27]);

            // Body first: chunks at offsets 8, 4088, 8168.
            for (frame, (off, len)) in frames[2..5]
                .iter()
                .zip([(8u32, 4080u32), (4088, 4080), (8168, 1832)])
            {
                assert_eq!(frame[0], 0x2D);
                assert_eq!(&frame[5..9], &off.to_be_bytes());
                assert_eq!(&frame[9..13], &len.to_be_bytes());
                assert_eq!(&frame[13..], &data[off as usize..(off + len) as usize]);
            }

            // Header bytes written last.
            let header_frame = &frames[6];
            assert_eq!(header_frame[0], 0x2D);
            assert_eq!(&header_frame[5..9], &0u32.to_be_bytes());
            assert_eq!(&header_frame[13..], &data[..8]);
        }

        #[test]
        fn api_upload_streams_chunks_and_finalizes()
        {
            let payload = vec![0x33u8; 100];
            let local = write_temp(&payload);

            let mut port = ScriptedPort::new();
            port.feed_ack(); // GET_FILE_INFO
            port.feed_packet(&[0x00, 0, 0, 0, 0, 0, 0, 0]); // does not exist
            port.feed_ack(); // START_UPLOAD
            port.feed(b"TOKN");
            port.feed_ack(); // FILE_CHUNK
            port.feed_ack(); // GET_LAST_STATUS
            port.feed_packet(&[0x40, 0, 0, 0]);
            port.feed_ack(); // FINISH_UPLOAD
            port.feed_ack(); // GET_LAST_STATUS
            port.feed_packet(&[0x40, 0, 0, 0]);
            let mut ops = live_ops(port);

            ops.write_file(local.path(), "/a/b", &WriteOptions::default())
                .unwrap();

            let frames = live_tx(&mut ops);
            let opcodes: Vec<u8> = frames.iter().map(|f| f[0]).collect();
            assert_eq!(opcodes, vec![0x2A, 0x21, 0x24, 0x23, 0x22, 0x23]);

            // START_UPLOAD flags: write/create, class 0, one block.
            assert_eq!(&frames[1][1..5], &0x3001u32.to_be_bytes());
            assert_eq!(&frames[1][9..13], b"/a/b");

            // The single chunk carries the payload at offset 0.
            assert_eq!(&frames[2][1..5], &0u32.to_be_bytes());
            assert_eq!(&frames[2][5..], &payload[..]);

            // FINISH_UPLOAD carries the unsigned 0x46 signature.
            assert_eq!(frames[4].len(), 1 + 63 + 256 + 1);
            assert!(frames[4][64..320].iter().all(|b| *b == 0x46));
        }

        #[test]
        fn device_error_status_aborts_the_upload()
        {
            let payload = vec![0x33u8; 10];
            let local = write_temp(&payload);

            let mut port = ScriptedPort::new();
            port.feed_ack();
            port.feed_packet(&[0x00, 0, 0, 0, 0, 0, 0, 0]);
            port.feed_ack();
            port.feed(b"TOKN");
            port.feed_ack(); // FILE_CHUNK
            port.feed_ack(); // GET_LAST_STATUS
            port.feed_packet(&[0x13, 0, 0, 0]); // device unhappy
            let mut ops = live_ops(port);

            let err = ops
                .write_file(local.path(), "/a/b", &WriteOptions::default())
                .unwrap_err();
            match kind(&err) {
                Error::DeviceStatus(0x13) => (),
                other => panic!("expected DeviceStatus, got {:?}", other),
            }
        }
    }
}
