//! Per-device configuration surface.

use serde::Deserialize;

use ndmp_common::NdmpError;

use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Md5,
    Text,
    None,
    /// Skip the client-auth exchange entirely.
    Void,
}

impl std::str::FromStr for AuthMethod {
    type Err = NdmpError;
    fn from_str(s: &str) -> Result<AuthMethod, NdmpError> {
        Ok(match s.to_lowercase().as_str() {
            "md5" => AuthMethod::Md5,
            "text" => AuthMethod::Text,
            "none" => AuthMethod::None,
            "void" => AuthMethod::Void,
            _ => {
                return Err(NdmpError::Config(format!(
                    "invalid auth method '{s}'"
                )))
            }
        })
    }
}

/// Options recognized by the NDMP tape device.  All of them have
/// defaults, so an embedder can deserialize a partial table (or none at
/// all) from its configuration file.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TapeOptions {
    pub username: String,
    pub password: String,
    pub auth: AuthMethod,

    /// Protocol-level tracing of every message sent and received.
    pub verbose: bool,

    /// Force IndirectTCP even when the server would accept a zero-length
    /// transfer window.
    pub indirect: bool,

    /// Block size for reads, when it differs from the write block size.
    /// Zero means "use the device block size".
    pub read_block_size: u32,
}

impl Default for TapeOptions {
    fn default() -> TapeOptions {
        TapeOptions {
            username: "ndmp".to_string(),
            password: "ndmp".to_string(),
            auth: AuthMethod::Md5,
            verbose: false,
            indirect: false,
            read_block_size: 0,
        }
    }
}

impl TapeOptions {
    pub fn from_toml(text: &str) -> Result<TapeOptions, NdmpError> {
        let opts: TapeOptions = toml::from_str(text)
            .map_err(|e| NdmpError::Config(e.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), NdmpError> {
        if self.read_block_size != 0
            && !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE)
                .contains(&self.read_block_size)
        {
            return Err(NdmpError::Config(format!(
                "read_block_size {} outside [{}, {}]",
                self.read_block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}
