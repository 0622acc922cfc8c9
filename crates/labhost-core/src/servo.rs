//! Servo debug board control.
//!
//! A servo gives the lab out-of-band control of a DUT: power state, the
//! USB key mux used for recovery installs, and EC/AP flash programming.
//! [`DutControlServo`] drives servod through the `dut-control` CLI.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::info;

use crate::error::HostError;
use crate::process::{display_command, run_command};

/// Time to let a DUT start booting after a servo power action.
pub const BOOT_DELAY: Duration = Duration::from_secs(10);

/// Budget for a single `dut-control` invocation.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for downloading a recovery image onto the servo USB key.
const USB_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Budget for flashing EC or AP firmware.
const FLASH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Who the servo USB key is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbKeyState {
    /// Visible to the DUT.
    Dut,
    /// Visible to the servo host.
    Host,
    /// Unpowered.
    Off,
}

/// Out-of-band control of a DUT.
pub trait Servo: Send + Sync {
    /// Sets a servod control.
    fn set(&self, control: &str, value: &str) -> Result<(), HostError>;

    /// Reads a servod control.
    fn get(&self, control: &str) -> Result<String, HostError>;

    /// Writes an EC image.
    fn program_ec(&self, image: &Path) -> Result<(), HostError>;

    /// Writes an AP firmware image.
    fn program_bios(&self, image: &Path) -> Result<(), HostError>;

    /// Forces the DUT off.
    fn power_off(&self) -> Result<(), HostError> {
        self.set("power_state", "off")
    }

    /// Powers the DUT on in normal mode.
    fn power_on(&self) -> Result<(), HostError> {
        self.set("power_state", "on")
    }

    /// Cold resets the DUT.
    fn reset(&self) -> Result<(), HostError> {
        self.set("power_state", "reset")
    }

    /// Moves the USB key between DUT and servo host, or powers it off.
    fn switch_usbkey(&self, state: UsbKeyState) -> Result<(), HostError> {
        match state {
            UsbKeyState::Off => self.set("prtctl4_pwren", "off"),
            UsbKeyState::Host => {
                self.set("prtctl4_pwren", "on")?;
                self.set("usb_mux_sel1", "servo_sees_usbkey")
            },
            UsbKeyState::Dut => {
                self.set("prtctl4_pwren", "on")?;
                self.set("usb_mux_sel1", "dut_sees_usbkey")
            },
        }
    }

    /// Writes `image_url` (or keeps the current image) to the USB key and
    /// boots the DUT from it in recovery mode.
    fn install_recovery_image(&self, image_url: Option<&str>) -> Result<(), HostError> {
        if let Some(url) = image_url {
            self.switch_usbkey(UsbKeyState::Host)?;
            info!(image_url = url, "downloading image to servo usb key");
            self.set("download_image_to_usb_dev", url)?;
        }
        self.switch_usbkey(UsbKeyState::Dut)?;
        self.set("power_state", "rec")
    }
}

/// Servo reached through `dut-control`.
#[derive(Debug, Clone)]
pub struct DutControlServo {
    dut_control: String,
    host: Option<String>,
    port: u16,
}

impl DutControlServo {
    /// Creates a handle for servod on `host:port`.
    #[must_use]
    pub fn new(dut_control: impl Into<String>, host: Option<String>, port: u16) -> Self {
        Self {
            dut_control: dut_control.into(),
            host,
            port,
        }
    }

    fn control_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.dut_control);
        cmd.arg("--port").arg(self.port.to_string());
        if let Some(host) = &self.host {
            cmd.arg("--server").arg(host);
        }
        cmd.args(args);
        cmd
    }

    fn run(&self, mut cmd: Command, timeout: Duration) -> Result<String, HostError> {
        Ok(run_command(&mut cmd, Some(timeout))?.check()?.stdout)
    }
}

impl Servo for DutControlServo {
    fn set(&self, control: &str, value: &str) -> Result<(), HostError> {
        let timeout = if control == "download_image_to_usb_dev" {
            USB_DOWNLOAD_TIMEOUT
        } else {
            CONTROL_TIMEOUT
        };
        self.run(
            self.control_command(&[format!("{control}:{value}")]),
            timeout,
        )?;
        Ok(())
    }

    fn get(&self, control: &str) -> Result<String, HostError> {
        let stdout = self.run(self.control_command(&[control.to_string()]), CONTROL_TIMEOUT)?;
        let line = stdout.trim();
        Ok(line
            .strip_prefix(control)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(line)
            .to_string())
    }

    fn program_ec(&self, image: &Path) -> Result<(), HostError> {
        let board = self.get("ec_board")?;
        let mut cmd = Command::new("flash_ec");
        cmd.arg(format!("--board={board}"))
            .arg(format!("--image={}", image.display()))
            .arg(format!("--port={}", self.port));
        info!(command = %display_command(&cmd), "programming EC");
        self.run(cmd, FLASH_TIMEOUT).map(|_| ())
    }

    fn program_bios(&self, image: &Path) -> Result<(), HostError> {
        let mut cmd = Command::new("futility");
        cmd.arg("update")
            .arg(format!("--servo_port={}", self.port))
            .arg("-i")
            .arg(image);
        info!(command = %display_command(&cmd), "programming AP firmware");
        self.run(cmd, FLASH_TIMEOUT).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingServo {
        sets: Mutex<Vec<String>>,
    }

    impl Servo for RecordingServo {
        fn set(&self, control: &str, value: &str) -> Result<(), HostError> {
            self.sets.lock().unwrap().push(format!("{control}:{value}"));
            Ok(())
        }

        fn get(&self, _: &str) -> Result<String, HostError> {
            Ok(String::new())
        }

        fn program_ec(&self, _: &Path) -> Result<(), HostError> {
            Ok(())
        }

        fn program_bios(&self, _: &Path) -> Result<(), HostError> {
            Ok(())
        }
    }

    #[test]
    fn test_control_command_line() {
        let servo = DutControlServo::new("dut-control", Some("labstation1".to_string()), 9901);
        let cmd = servo.control_command(&["power_state:off".to_string()]);
        assert_eq!(
            display_command(&cmd),
            "dut-control --port 9901 --server labstation1 power_state:off"
        );
    }

    #[test]
    fn test_recovery_install_sequence() {
        let servo = RecordingServo::default();
        servo
            .install_recovery_image(Some("http://ds/static/img/chromiumos_test_image.bin"))
            .unwrap();

        assert_eq!(
            *servo.sets.lock().unwrap(),
            vec![
                "prtctl4_pwren:on",
                "usb_mux_sel1:servo_sees_usbkey",
                "download_image_to_usb_dev:http://ds/static/img/chromiumos_test_image.bin",
                "prtctl4_pwren:on",
                "usb_mux_sel1:dut_sees_usbkey",
                "power_state:rec",
            ]
        );
    }

    #[test]
    fn test_get_strips_control_prefix() {
        let servo = DutControlServo::new("echo", None, 9999);
        // `echo --port 9999 ec_board` prints its arguments back.
        let value = servo.get("ec_board").unwrap();
        assert_eq!(value, "--port 9999 ec_board");
    }
}
