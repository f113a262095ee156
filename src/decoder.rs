//! Streaming decoder for weight frames arriving over the serial channel.
//!
//! The instrument emits text lines of the form `[sign]<number> <unit>[ <marker>]`
//! terminated by CRLF (some firmware revisions send bare LF). Frames arrive in
//! arbitrary chunk boundaries, so the decoder keeps a backlog of undelimited
//! text across calls and only emits a reading once a full line is present.
//! Lines that do not match the grammar are expected noise on a live link and
//! are dropped without error.

use chrono::{DateTime, Utc};

/// Maximum backlog size before the oldest bytes are discarded.
///
/// A link that never sends a terminator (desynced baud, binary noise) must
/// not grow the backlog without bound.
const MAX_BACKLOG: usize = 1024;

/// Weight units reported by the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WeightUnit {
    /// Kilograms.
    Kilograms,
    /// Grams.
    Grams,
    /// Pounds.
    Pounds,
    /// Ounces.
    Ounces,
}

impl WeightUnit {
    /// Parse a unit token, case-insensitively.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "kg" => Some(Self::Kilograms),
            "g" => Some(Self::Grams),
            "lb" => Some(Self::Pounds),
            "oz" => Some(Self::Ounces),
            _ => None,
        }
    }

    /// The token the instrument uses for this unit.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kilograms => "kg",
            Self::Grams => "g",
            Self::Pounds => "lb",
            Self::Ounces => "oz",
        }
    }
}

impl std::fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One decoded measurement from the instrument.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WeightReading {
    /// Numeric weight value.
    pub value: f64,
    /// Unit the value was reported in.
    pub unit: WeightUnit,
    /// Whether the instrument reported the value as settled.
    pub stable: bool,
    /// The trimmed source line the reading was decoded from.
    pub raw: String,
    /// When the reading was decoded.
    pub captured_at: DateTime<Utc>,
}

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Trailing single-character marker the instrument appends to unstable
    /// readings. Vendor firmware families differ on the exact glyph.
    pub unstable_marker: char,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            unstable_marker: '?',
        }
    }
}

/// Streaming frame decoder.
///
/// Feed raw chunks with [`feed`](FrameDecoder::feed); complete readings come
/// back in arrival order. The partial tail survives across calls, so feeding
/// a stream one byte at a time yields the same readings as feeding it whole.
pub struct FrameDecoder {
    config: DecoderConfig,
    backlog: String,
}

impl FrameDecoder {
    /// Create a decoder with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    /// Create a decoder with an explicit configuration.
    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            config,
            backlog: String::new(),
        }
    }

    /// Append a raw chunk and return any complete readings it unlocked.
    ///
    /// Malformed lines are skipped; this never fails.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<WeightReading> {
        self.backlog.push_str(&String::from_utf8_lossy(bytes));

        let mut readings = Vec::new();
        while let Some(line) = self.take_line() {
            if let Some(reading) = self.parse_line(&line) {
                readings.push(reading);
            }
        }

        if self.backlog.len() > MAX_BACKLOG {
            let excess = self.backlog.len() - MAX_BACKLOG;
            // char_indices so we never split inside a multi-byte sequence
            let cut = self
                .backlog
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= excess)
                .unwrap_or(self.backlog.len());
            self.backlog.drain(..cut);
        }

        readings
    }

    /// Discard any buffered partial frame.
    ///
    /// Called on every disconnect so reconnection noise is never stitched
    /// onto stale bytes.
    pub fn clear(&mut self) {
        self.backlog.clear();
    }

    /// Number of buffered bytes awaiting a terminator.
    pub fn pending_len(&self) -> usize {
        self.backlog.len()
    }

    /// Extract the next complete line from the backlog.
    ///
    /// Splits at the first LF and absorbs a preceding CR, so CRLF and
    /// bare-LF terminated frames both delimit exactly one line.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.backlog.find('\n')?;
        let line = self.backlog[..pos].trim_end_matches('\r').to_string();
        self.backlog.drain(..pos + 1);
        Some(line)
    }

    /// Match one trimmed line against the frame grammar:
    /// optional sign, decimal number, whitespace, unit token, optional
    /// trailing instability marker.
    fn parse_line(&self, line: &str) -> Option<WeightReading> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let mut rest = trimmed;

        // Trailing marker is its own token, never part of the unit.
        let mut stable = true;
        if let Some(stripped) = rest.strip_suffix(self.config.unstable_marker) {
            stable = false;
            rest = stripped.trim_end();
        }

        // Unit is the trailing alphabetic run.
        let unit_start = rest
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_alphabetic())
            .last()
            .map(|(i, _)| i)?;
        let unit = WeightUnit::parse(&rest[unit_start..])?;

        let number = rest[..unit_start].trim();
        if number.is_empty() {
            return None;
        }
        let value: f64 = number.parse().ok()?;

        Some(WeightReading {
            value,
            unit,
            stable,
            raw: trimmed.to_string(),
            captured_at: Utc::now(),
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
