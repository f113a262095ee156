//! Command vocabulary and serial-line configuration for the instrument.
//!
//! Commands are short text tokens terminated by CRLF, fire-and-forget: no
//! response correlation is attempted, the next weight line is assumed to
//! reflect the command's effect.

/// Line terminator appended to every outgoing command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Tare the scale.
pub const CMD_TARE: &str = "T";
/// Zero the scale.
pub const CMD_ZERO: &str = "Z";
/// Request a single reading.
pub const CMD_READ_WEIGHT: &str = "IP";
/// Begin continuous reporting.
pub const CMD_CONTINUOUS: &str = "CP";
/// Stop continuous reporting.
pub const CMD_STOP_CONTINUOUS: &str = "SCP";

/// Frame a command for the wire by appending the line terminator.
pub fn frame(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + LINE_TERMINATOR.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(LINE_TERMINATOR.as_bytes());
    bytes
}

/// Parity setting for the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl Parity {
    fn code(&self) -> char {
        match self {
            Self::None => 'N',
            Self::Even => 'E',
            Self::Odd => 'O',
        }
    }
}

/// Serial-line parameters sent to the instrument's bridge during the
/// configuration handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialConfig {
    /// Baud rate.
    pub baud: u32,
    /// Data bits per frame.
    pub data_bits: u8,
    /// Stop bits per frame.
    pub stop_bits: u8,
    /// Parity setting.
    pub parity: Parity,
}

impl Default for SerialConfig {
    /// Factory settings of the target instrument: 9600/8/1/none.
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl SerialConfig {
    /// Render the configuration command sent during the handshake.
    pub fn command_line(&self) -> String {
        format!(
            "COM {},{},{},{}",
            self.baud,
            self.data_bits,
            self.stop_bits,
            self.parity.code()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_appends_crlf() {
        assert_eq!(frame(CMD_TARE), b"T\r\n");
        assert_eq!(frame(CMD_STOP_CONTINUOUS), b"SCP\r\n");
    }

    #[test]
    fn test_default_serial_config() {
        let config = SerialConfig::default();
        assert_eq!(config.baud, 9600);
        assert_eq!(config.command_line(), "COM 9600,8,1,N");
    }

    #[test]
    fn test_parity_codes() {
        let config = SerialConfig {
            baud: 19200,
            data_bits: 7,
            stop_bits: 2,
            parity: Parity::Even,
        };
        assert_eq!(config.command_line(), "COM 19200,7,2,E");
    }
}
