use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{ArgEnum, CommandFactory, Parser, Subcommand};

mod bootloader;
mod error;
mod link;
mod ops;
mod session;
mod sffs;
mod storage;

use bootloader::Bootloader;
use link::{LinkPort, SerialLink};
use ops::{FsOps, WriteOptions};
use session::{PinConfig, PinSource, Session};
use sffs::DeviceKind;
use storage::ImageStore;

#[derive(Debug, Parser)]
#[clap(name = "ccflash", version, about = "Serial flash utility for CC3200")]
struct Args {
    /// The serial port to use
    #[clap(short = 'p', long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Use an image file instead of the serial link (read)
    #[clap(long = "image_file", value_name = "FILE", parse(from_os_str))]
    image_file: Option<PathBuf>,

    /// Use an image file instead of the serial link (write)
    #[clap(long = "output_file", value_name = "FILE", parse(from_os_str))]
    output_file: Option<PathBuf>,

    /// dtr, rts, none or prompt, optionally prefixed by ~ to invert
    #[clap(long, parse(try_from_str = parse_reset_pin), default_value = "none")]
    reset: PinConfig,

    /// dtr, rts or none, optionally prefixed by ~ to invert
    #[clap(long, parse(try_from_str = parse_sop2_pin), default_value = "none")]
    sop2: PinConfig,

    /// Block erase timeout for all operations which involve block erasing
    #[clap(long = "erase_timeout", parse(try_from_str = auto_int), default_value = "120")]
    erase_timeout: i64,

    /// When finished, reboot to the application
    #[clap(long = "reboot-to-app")]
    reboot_to_app: bool,

    /// Device to select cc3200/cc32xx (to decide which offsets to use)
    #[clap(short = 'd', long, arg_enum, default_value = "cc3200")]
    device: DeviceKind,

    #[clap(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Format the flash memory
    #[clap(name = "format_flash")]
    FormatFlash {
        #[clap(short, long, arg_enum, default_value = "1M")]
        size: SlfsSize,
    },

    /// Erase a file from the SL filesystem
    #[clap(name = "erase_file")]
    EraseFile {
        /// file on the target to be removed
        filename: String,
    },

    /// Upload a file on the SL filesystem
    #[clap(name = "write_file")]
    WriteFile {
        /// file on the local file system
        #[clap(parse(from_os_str))]
        local_file: PathBuf,

        /// file name to write on the target
        cc_filename: String,

        /// file which contains the 256 bytes of signature for secured files
        #[clap(long, parse(from_os_str))]
        signature: Option<PathBuf>,

        /// allows allocating more space than needed for this upload
        #[clap(long = "file-size", parse(try_from_str = auto_int), default_value = "0")]
        file_size: i64,

        /// enables fail safe MIRROR feature
        #[clap(long = "commit-flag")]
        commit_flag: bool,

        /// if filename not available you can write a file by its id (image file only)
        #[clap(long = "file-id", parse(try_from_str = auto_int), default_value = "-1")]
        file_id: i64,
    },

    /// Read a file from the SL filesystem
    #[clap(name = "read_file")]
    ReadFile {
        /// file to read from the target
        cc_filename: String,

        /// local path to store the file contents in
        #[clap(parse(from_os_str))]
        local_file: PathBuf,

        /// if filename not available you can read a file by its id
        #[clap(long = "file-id", parse(try_from_str = auto_int), default_value = "-1")]
        file_id: i64,
    },

    /// Write a Gang image on the flash
    #[clap(name = "write_flash")]
    WriteFlash {
        /// gang image file prepared with Uniflash
        #[clap(parse(from_os_str))]
        image_file: PathBuf,

        /// do not perform an erase before write (for blank chips)
        #[clap(long = "no-erase")]
        no_erase: bool,
    },

    /// Read SFFS contents into the file
    #[clap(name = "read_flash")]
    ReadFlash {
        /// path to store the SFFS dump
        #[clap(parse(from_os_str))]
        dump_file: PathBuf,

        /// starting offset (default is 0)
        #[clap(long, parse(try_from_str = auto_int), default_value = "0")]
        offset: i64,

        /// dump size (default is complete SFFS)
        #[clap(long, parse(try_from_str = auto_int), default_value = "-1")]
        size: i64,
    },

    /// List SFFS contents and statistics (blocks total/used, inter-file gaps, etc)
    #[clap(name = "list_filesystem")]
    ListFilesystem {
        /// output in JSON format to stdout
        #[clap(long = "json-output")]
        json_output: bool,

        /// output inactive FAT copy
        #[clap(long)]
        inactive: bool,

        /// read the file headers and show sizes in bytes
        #[clap(long)]
        extended: bool,
    },

    /// Read all files into a subfolder structure
    #[clap(name = "read_all_files")]
    ReadAllFiles {
        /// local path to store the files in
        #[clap(parse(from_os_str))]
        local_dir: PathBuf,

        /// read unknown filenames by id
        #[clap(long = "by-file-id")]
        by_file_id: bool,
    },

    /// Write all files from a subfolder structure
    #[clap(name = "write_all_files")]
    WriteAllFiles {
        /// local path to read the files from
        #[clap(parse(from_os_str))]
        local_dir: PathBuf,

        /// list the files to be written and skip writing them
        #[clap(long)]
        simulate: bool,
    },
}

#[derive(Copy, Clone, Debug, ArgEnum)]
enum SlfsSize {
    #[clap(name = "512")]
    Kib512,
    #[clap(name = "1M")]
    Mb1,
    #[clap(name = "2M")]
    Mb2,
    #[clap(name = "4M")]
    Mb4,
    #[clap(name = "8M")]
    Mb8,
    #[clap(name = "16M")]
    Mb16,
}

impl SlfsSize {
    fn kib(self) -> u32
    {
        match self {
            SlfsSize::Kib512 => 512,
            SlfsSize::Mb1 => 1024,
            SlfsSize::Mb2 => 2 * 1024,
            SlfsSize::Mb4 => 4 * 1024,
            SlfsSize::Mb8 => 8 * 1024,
            SlfsSize::Mb16 => 16 * 1024,
        }
    }
}

/// Integer argument that also accepts 0x/0o/0b prefixes.
fn auto_int(arg: &str) -> Result<i64, String>
{
    let (negative, rest) = match arg.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, arg),
    };

    let parsed = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = rest.strip_prefix("0o") {
        i64::from_str_radix(oct, 8)
    } else if let Some(bin) = rest.strip_prefix("0b") {
        i64::from_str_radix(bin, 2)
    } else {
        rest.parse()
    };

    match parsed {
        Ok(v) if negative => Ok(-v),
        Ok(v) => Ok(v),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_reset_pin(arg: &str) -> Result<PinConfig, String>
{
    PinConfig::parse(arg, true).map_err(|e| e.to_string())
}

fn parse_sop2_pin(arg: &str) -> Result<PinConfig, String>
{
    PinConfig::parse(arg, false).map_err(|e| e.to_string())
}

const SUBCOMMAND_NAMES: &[&str] = &[
    "format_flash",
    "erase_file",
    "write_file",
    "read_file",
    "write_flash",
    "read_flash",
    "list_filesystem",
    "read_all_files",
    "write_all_files",
];

/// Partition argv into per-subcommand sections so options like
/// `--file-size` attach to their own `write_file`. The first section
/// carries the global options. `-if`/`-of` are folded to their long
/// spellings on the way through.
fn split_argv(argv: Vec<String>) -> Vec<Vec<String>>
{
    let mut sections = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut have_cmd = false;

    for arg in argv {
        let arg = match arg.as_str() {
            "-if" => "--image_file".to_string(),
            "-of" => "--output_file".to_string(),
            _ => arg,
        };

        if SUBCOMMAND_NAMES.contains(&arg.as_str()) {
            if have_cmd {
                sections.push(current);
                current = Vec::new();
            }
            have_cmd = true;
        }

        current.push(arg);
    }

    if !current.is_empty() {
        sections.push(current);
    }

    sections
}

fn run_command<P: LinkPort>(ops: &mut FsOps<P>, cmd: &Command) -> anyhow::Result<()>
{
    ops.begin_command()?;
    let res = dispatch(ops, cmd);
    ops.finish_command();

    res
}

fn dispatch<P: LinkPort>(ops: &mut FsOps<P>, cmd: &Command) -> anyhow::Result<()>
{
    match cmd {
        Command::FormatFlash { size } => ops.format_slfs(size.kib()),

        Command::EraseFile { filename } => {
            log::info!("Erasing file {}", filename);
            ops.erase_file(filename, false)
        }

        Command::WriteFile {
            local_file,
            cc_filename,
            signature,
            file_size,
            commit_flag,
            file_id,
        } => {
            let opts = WriteOptions {
                signature: signature.clone(),
                file_size: (*file_size).max(0) as u32,
                commit: *commit_flag,
                file_id: *file_id,
            };
            ops.write_file(local_file, cc_filename, &opts)
        }

        Command::ReadFile {
            cc_filename,
            local_file,
            file_id,
        } => ops.read_file(cc_filename, local_file, *file_id),

        Command::WriteFlash {
            image_file,
            no_erase,
        } => ops.write_flash(image_file, !no_erase),

        Command::ReadFlash {
            dump_file,
            offset,
            size,
        } => ops.read_flash(dump_file, *offset, *size),

        Command::ListFilesystem {
            json_output,
            inactive,
            extended,
        } => ops.list_filesystem(*json_output, *inactive, *extended),

        Command::ReadAllFiles {
            local_dir,
            by_file_id,
        } => ops.read_all_files(local_dir, *by_file_id),

        Command::WriteAllFiles {
            local_dir,
            simulate,
        } => ops.write_all_files(local_dir, *simulate),
    }
}

fn main()
{
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let argv: Vec<String> = std::env::args().skip(1).collect();

    let mut commands: Vec<Args> = Vec::new();
    for section in split_argv(argv) {
        let mut full = vec!["ccflash".to_string()];
        full.extend(section);
        commands.push(Args::parse_from(full));
    }

    if commands.iter().all(|c| c.cmd.is_none()) {
        Args::command().print_help().ok();
        process::exit(-1);
    }

    let args = &commands[0];

    if args.sop2.source == args.reset.source && args.reset.source != PinSource::None {
        log::error!("sop2 and reset methods cannot be the same output pin");
        process::exit(-3);
    }

    let mut ops: FsOps<Box<dyn serialport::SerialPort>> = match &args.image_file {
        Some(image_path) => {
            let mut store = match ImageStore::open(image_path, args.output_file.as_deref()) {
                Ok(store) => store,
                Err(e) => {
                    log::error!("unable to open image file: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = store.copy_input_to_output() {
                log::error!("unable to seed output image: {}", e);
                process::exit(1);
            }
            FsOps::offline(store, args.device)
        }

        None => {
            let link = match SerialLink::open(&args.port) {
                Ok(link) => link,
                Err(e) => {
                    log::warn!("unable to open serial port {}: {}", args.port, e);
                    process::exit(-2);
                }
            };

            let erase_timeout = Duration::from_secs(args.erase_timeout.max(0) as u64);
            let boot = Bootloader::new(link, erase_timeout);
            let mut session = Session::new(boot, args.reset, args.sop2);

            if let Err(e) = session.connect() {
                log::error!("Could not connect to target: {}", e);
                process::exit(-3);
            }
            log::info!("connected to target");
            if let Some(vinfo) = session.vinfo() {
                log::info!("Version: {:?}", vinfo);
            }

            if session.vinfo().map_or(false, |v| v.is_cc3200()) {
                log::info!("This is a CC3200 device");
            }
            if let Err(e) = session.switch_to_nwp_bootloader() {
                log::error!("Could not connect to target: {}", e);
                process::exit(-3);
            }
            if let Some(vinfo_apps) = session.vinfo_apps() {
                log::info!("APPS version: {:?}", vinfo_apps);
            }

            FsOps::live(session, args.device)
        }
    };

    let mut check_fat = false;

    for parsed in &commands {
        let cmd = match &parsed.cmd {
            Some(cmd) => cmd,
            None => continue,
        };

        if let Err(e) = run_command(&mut ops, cmd) {
            log::error!("{:#}", e);
            process::exit(1);
        }

        if matches!(cmd, Command::WriteFile { .. } | Command::WriteAllFiles { .. }) {
            check_fat = true;
        }
    }

    // Post-write verification: re-read the FAT once all commands ran.
    if check_fat {
        match ops.get_fat_info(false, false) {
            Ok(info) => info.print_short(),
            Err(e) => {
                log::error!("{}", e);
                process::exit(1);
            }
        }
    }

    if args.reboot_to_app {
        if let Err(e) = ops.reboot_to_app() {
            log::error!("{:#}", e);
            process::exit(1);
        }
    }

    log::info!("All commands done, bye.");
}


#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String>
    {
        args.iter().map(|s| s.to_string()).collect()
    }

    mod argv_splitting {
        use super::*;

        #[test]
        fn sections_break_on_subcommand_tokens()
        {
            let sections = split_argv(argv(&[
                "-p",
                "/dev/ttyUSB1",
                "write_file",
                "a.bin",
                "/a",
                "--file-size",
                "0x100",
                "write_file",
                "b.bin",
                "/b",
                "list_filesystem",
            ]));

            assert_eq!(sections.len(), 3);
            assert_eq!(
                sections[0],
                argv(&["-p", "/dev/ttyUSB1", "write_file", "a.bin", "/a", "--file-size", "0x100"])
            );
            assert_eq!(sections[1], argv(&["write_file", "b.bin", "/b"]));
            assert_eq!(sections[2], argv(&["list_filesystem"]));
        }

        #[test]
        fn short_image_flags_are_normalized()
        {
            let sections =
                split_argv(argv(&["-if", "in.img", "-of", "out.img", "list_filesystem"]));

            assert_eq!(sections.len(), 1);
            assert_eq!(
                sections[0],
                argv(&["--image_file", "in.img", "--output_file", "out.img", "list_filesystem"])
            );
        }

        #[test]
        fn globals_without_a_command_form_one_section()
        {
            let sections = split_argv(argv(&["-p", "/dev/ttyUSB0"]));
            assert_eq!(sections.len(), 1);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn auto_int_accepts_prefixed_radices()
        {
            assert_eq!(auto_int("120").unwrap(), 120);
            assert_eq!(auto_int("0x2000").unwrap(), 0x2000);
            assert_eq!(auto_int("0b101").unwrap(), 5);
            assert_eq!(auto_int("-1").unwrap(), -1);
            assert!(auto_int("nope").is_err());
        }

        #[test]
        fn slfs_sizes_map_to_kib()
        {
            assert_eq!(SlfsSize::Kib512.kib(), 512);
            assert_eq!(SlfsSize::Mb1.kib(), 1024);
            assert_eq!(SlfsSize::Mb16.kib(), 16384);
        }

        #[test]
        fn write_file_options_attach_to_their_section()
        {
            let args = Args::try_parse_from([
                "ccflash",
                "--image_file",
                "in.img",
                "--output_file",
                "out.img",
                "write_file",
                "local.bin",
                "/sys/cfg",
                "--file-size",
                "0x2000",
                "--commit-flag",
            ])
            .unwrap();

            assert_eq!(args.image_file.unwrap(), PathBuf::from("in.img"));
            match args.cmd.unwrap() {
                Command::WriteFile {
                    cc_filename,
                    file_size,
                    commit_flag,
                    file_id,
                    ..
                } => {
                    assert_eq!(cc_filename, "/sys/cfg");
                    assert_eq!(file_size, 0x2000);
                    assert!(commit_flag);
                    assert_eq!(file_id, -1);
                }
                other => panic!("wrong command parsed: {:?}", other),
            }
        }

        #[test]
        fn reset_pin_accepts_inversion_and_prompt()
        {
            let args =
                Args::try_parse_from(["ccflash", "--reset", "~dtr", "list_filesystem"]).unwrap();
            assert!(args.reset.invert);
            assert_eq!(args.reset.source, PinSource::Dtr);

            let args =
                Args::try_parse_from(["ccflash", "--reset", "prompt", "list_filesystem"]).unwrap();
            assert_eq!(args.reset.source, PinSource::Prompt);

            assert!(
                Args::try_parse_from(["ccflash", "--sop2", "prompt", "list_filesystem"]).is_err()
            );
        }

        #[test]
        fn format_sizes_parse_by_name()
        {
            let args = Args::try_parse_from(["ccflash", "format_flash", "-s", "2M"]).unwrap();
            match args.cmd.unwrap() {
                Command::FormatFlash { size } => assert_eq!(size.kib(), 2048),
                other => panic!("wrong command parsed: {:?}", other),
            }
        }
    }
}
