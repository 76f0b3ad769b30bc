use std::io::BufRead;
use std::thread;
use std::time::Duration;

use crate::bootloader::{Bootloader, StorageId, VersionInfo};
use crate::error::{Error, Result};
use crate::link::LinkPort;

/// NWP bootloader helper image, executed from SRAM after the UART
/// switch. Packaged with the tool.
static NWP_HELPER_DLL: &[u8] = include_bytes!("dll/rbtl3100s.dll");

const BREAK_TRIES: u32 = 5;
const BREAK_TIMEOUT: Duration = Duration::from_secs(2);

/// Which modem line drives a control pin.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinSource {
    Dtr,
    Rts,
    None,
    Prompt,
}

/// A control line assignment, optionally inverted with a `~` prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PinConfig {
    pub invert: bool,
    pub source: PinSource,
}

impl PinConfig {
    pub fn parse(arg: &str, allow_prompt: bool) -> Result<Self>
    {
        let (invert, name) = match arg.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, arg),
        };

        let source = match name {
            "dtr" => PinSource::Dtr,
            "rts" => PinSource::Rts,
            "none" => PinSource::None,
            "prompt" if allow_prompt => PinSource::Prompt,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a valid pin assignment",
                    arg
                )))
            }
        };

        Ok(Self { invert, source })
    }
}

/// Session lifecycle. Commands may only run from `Idle` (NWP direct) or
/// `AppsBootloader` (after the CC3200 switch); `Closed` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connected,
    AppsBootloader,
    Idle,
    Busy,
    Closed,
}

/// A live connection to the device's bootloader.
#[derive(Debug)]
pub struct Session<P> {
    pub(crate) boot: Bootloader<P>,
    reset: PinConfig,
    sop2: PinConfig,
    state: SessionState,
    vinfo: Option<VersionInfo>,
    vinfo_apps: Option<VersionInfo>,
}

impl<P: LinkPort> Session<P> {
    pub fn new(boot: Bootloader<P>, reset: PinConfig, sop2: PinConfig) -> Self
    {
        Self {
            boot,
            reset,
            sop2,
            state: SessionState::New,
            vinfo: None,
            vinfo_apps: None,
        }
    }

    pub fn state(&self) -> SessionState
    {
        self.state
    }

    pub fn vinfo(&self) -> Option<&VersionInfo>
    {
        self.vinfo.as_ref()
    }

    pub fn vinfo_apps(&self) -> Option<&VersionInfo>
    {
        self.vinfo_apps.as_ref()
    }

    fn require_state(&self, allowed: &[SessionState], doing: &str) -> Result<()>
    {
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidArgument(format!(
                "cannot {} in session state {:?}",
                doing, self.state
            )));
        }

        Ok(())
    }

    fn set_sop2(&mut self, level: bool) -> Result<()>
    {
        let toset = level ^ self.sop2.invert;

        match self.sop2.source {
            PinSource::Dtr => self.boot.link.set_dtr(toset),
            PinSource::Rts => self.boot.link.set_rts(toset),
            _ => Ok(()),
        }
    }

    fn do_reset(&mut self, sop2: bool) -> Result<()>
    {
        self.set_sop2(sop2)?;

        match self.reset.source {
            PinSource::None => Ok(()),
            PinSource::Prompt => {
                println!(
                    "Reset the device with SOP2 {}asserted and press Enter",
                    if sop2 { "" } else { "de" }
                );
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line)?;
                Ok(())
            }
            PinSource::Dtr => {
                let in_reset = true ^ self.reset.invert;
                self.boot.link.set_dtr(in_reset)?;
                thread::sleep(Duration::from_millis(100));
                self.boot.link.set_dtr(!in_reset)
            }
            PinSource::Rts => {
                let in_reset = true ^ self.reset.invert;
                self.boot.link.set_rts(in_reset)?;
                thread::sleep(Duration::from_millis(100));
                self.boot.link.set_rts(!in_reset)
            }
        }
    }

    /// Reset into the ROM bootloader and read the version report.
    pub fn connect(&mut self) -> Result<()>
    {
        self.require_state(&[SessionState::New], "connect")?;

        log::info!("Connecting to target...");
        self.boot.link.flush_input()?;
        self.do_reset(true)?;
        self.boot.link.break_in(BREAK_TRIES, BREAK_TIMEOUT)?;

        log::info!("Connected, reading version...");
        self.vinfo = Some(self.boot.get_version()?);
        self.state = SessionState::Connected;

        Ok(())
    }

    /// On CC3200-class parts, move from the ROM bootloader to the NWP
    /// bootloader: switch the UART to the APPS MCU, upload the helper
    /// image into SRAM and execute it. NWP-direct parts just settle
    /// into `Idle`.
    pub fn switch_to_nwp_bootloader(&mut self) -> Result<()>
    {
        self.require_state(&[SessionState::Connected], "switch bootloaders")?;

        log::info!("Switching to NWP bootloader...");
        let vinfo = self.boot.get_version()?;

        if !vinfo.is_cc3200() {
            log::debug!("This looks like the NWP already");
            self.state = SessionState::Idle;
            return Ok(());
        }

        if vinfo.bootloader[1] < 4 {
            return Err(Error::UnsupportedDevice(format!(
                "bootloader version {} is not supported",
                vinfo.bootloader[1]
            )));
        }

        self.switch_uart_to_apps()?;

        log::info!("Uploading rbtl3100s.dll...");
        self.boot.raw_write(StorageId::Sram, 0, NWP_HELPER_DLL)?;
        self.boot.exec_from_ram()?;

        if !self.boot.link.read_ack(None)? {
            return Err(Error::Protocol("got no ACK after exec from ram".to_string()));
        }

        self.state = SessionState::AppsBootloader;

        Ok(())
    }

    fn switch_uart_to_apps(&mut self) -> Result<()>
    {
        // ~1 sec delay by the APPS MCU
        log::info!("Switching UART to APPS...");
        self.boot.switch_to_apps()?;

        log::info!("Resetting communications ...");
        thread::sleep(Duration::from_secs(1));
        self.boot.link.break_in(BREAK_TRIES, BREAK_TIMEOUT)?;
        self.vinfo_apps = Some(self.boot.get_version()?);

        Ok(())
    }

    pub fn begin_command(&mut self) -> Result<()>
    {
        self.require_state(
            &[SessionState::Idle, SessionState::AppsBootloader],
            "execute a command",
        )?;
        self.state = SessionState::Busy;

        Ok(())
    }

    pub fn finish_command(&mut self)
    {
        if self.state == SessionState::Busy {
            self.state = SessionState::Idle;
        }
    }

    /// Re-pulse reset with SOP2 de-asserted; ends the session.
    pub fn reboot_to_app(&mut self) -> Result<()>
    {
        log::info!("Rebooting to application");
        self.do_reset(false)?;
        self.state = SessionState::Closed;

        Ok(())
    }
}
