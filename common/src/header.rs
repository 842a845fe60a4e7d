//! Build and parse the archive headers written at the front of a volume
//! and at the front of each filemark-delimited file.
//!
//! Headers are a single text line, NUL-padded out to one full tape block.
//! The tape-start header carries the volume label and timestamp; file
//! headers carry a name and timestamp; the tape-end header marks end of
//! data for readers that land past the last file.

use anyhow::{bail, Result};

const HEADER_MAGIC: &str = "NDMPTAPE:";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TapeHeaderKind {
    /// Parsed block was not a recognizable header (or no block at all).
    Empty,
    TapeStart,
    File,
    TapeEnd,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TapeHeader {
    pub kind: TapeHeaderKind,

    /// Volume label; only meaningful for `TapeStart`.
    pub label: String,

    /// Write timestamp, `YYYYMMDDhhmmss` by convention.
    pub datestamp: String,

    /// File name; only meaningful for `File`.
    pub name: String,
}

impl TapeHeader {
    pub fn empty() -> TapeHeader {
        TapeHeader {
            kind: TapeHeaderKind::Empty,
            label: String::new(),
            datestamp: String::new(),
            name: String::new(),
        }
    }

    pub fn tapestart(label: &str, datestamp: &str) -> TapeHeader {
        TapeHeader {
            kind: TapeHeaderKind::TapeStart,
            label: label.to_string(),
            datestamp: datestamp.to_string(),
            name: String::new(),
        }
    }

    pub fn file(name: &str, datestamp: &str) -> TapeHeader {
        TapeHeader {
            kind: TapeHeaderKind::File,
            label: String::new(),
            datestamp: datestamp.to_string(),
            name: name.to_string(),
        }
    }

    pub fn tapeend(datestamp: &str) -> TapeHeader {
        TapeHeader {
            kind: TapeHeaderKind::TapeEnd,
            label: String::new(),
            datestamp: datestamp.to_string(),
            name: String::new(),
        }
    }

    fn to_line(&self) -> Result<String> {
        let line = match self.kind {
            TapeHeaderKind::TapeStart => format!(
                "{} TAPESTART DATE {} TAPE {}\n",
                HEADER_MAGIC, self.datestamp, self.label
            ),
            TapeHeaderKind::File => format!(
                "{} FILE DATE {} NAME {}\n",
                HEADER_MAGIC, self.datestamp, self.name
            ),
            TapeHeaderKind::TapeEnd => {
                format!("{} TAPEEND DATE {}\n", HEADER_MAGIC, self.datestamp)
            }
            TapeHeaderKind::Empty => {
                bail!("cannot build a header block for an empty header")
            }
        };
        Ok(line)
    }

    /// Render this header as exactly one NUL-padded block of `block_size`
    /// bytes.  Fails if the header text does not fit in a single block.
    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>> {
        let line = self.to_line()?;
        if line.len() > block_size {
            bail!(
                "header ({} bytes) does not fit in a single {} byte block",
                line.len(),
                block_size
            );
        }
        let mut block = vec![0u8; block_size];
        block[..line.len()].copy_from_slice(line.as_bytes());
        Ok(block)
    }

    /// Parse a block read from media.  Unrecognizable content yields an
    /// `Empty` header rather than an error, so callers can distinguish
    /// "no label" from "could not read".
    pub fn parse(block: &[u8]) -> TapeHeader {
        let end = block
            .iter()
            .position(|&b| b == 0 || b == b'\n')
            .unwrap_or(block.len());
        let line = match std::str::from_utf8(&block[..end]) {
            Ok(s) => s,
            Err(_) => return TapeHeader::empty(),
        };

        let mut words = line.split_whitespace();
        if words.next() != Some(HEADER_MAGIC) {
            return TapeHeader::empty();
        }

        let kind = match words.next() {
            Some("TAPESTART") => TapeHeaderKind::TapeStart,
            Some("FILE") => TapeHeaderKind::File,
            Some("TAPEEND") => TapeHeaderKind::TapeEnd,
            _ => return TapeHeader::empty(),
        };

        let mut hdr = TapeHeader::empty();
        hdr.kind = kind;

        // remaining words are KEY VALUE pairs
        while let Some(key) = words.next() {
            let Some(value) = words.next() else {
                break;
            };
            match key {
                "DATE" => hdr.datestamp = value.to_string(),
                "TAPE" => hdr.label = value.to_string(),
                "NAME" => hdr.name = value.to_string(),
                _ => (),
            }
        }

        hdr
    }
}
