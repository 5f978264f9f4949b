//! Runtime kernel parameters.

use core::str::FromStr;

use log::LevelFilter;
use misaka_kernel_params::{NPROC, PEX_BUFFER_SIZE, PIPE_SIZE, PTY_BUFFER_SIZE};

use crate::error::KernelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of process table slots.
    pub nproc: usize,
    pub pipe_size: usize,
    pub pty_size: usize,
    pub pex_size: usize,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nproc: NPROC,
            pipe_size: PIPE_SIZE,
            pty_size: PTY_BUFFER_SIZE,
            pex_size: PEX_BUFFER_SIZE,
            log_level: LevelFilter::Warn,
        }
    }
}

impl KernelConfig {
    /// Parses a kernel command line such as `nproc=16 pipe_size=512 loglevel=debug`.
    ///
    /// Tokens without `=` and unknown keys are skipped.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, KernelError> {
        let mut config = Self::default();
        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                log::debug!("ignoring cmdline flag {token:?}");
                continue;
            };
            match key {
                "nproc" => config.nproc = parse_nonzero(value)?,
                "pipe_size" => config.pipe_size = parse_nonzero(value)?,
                "pty_size" => config.pty_size = parse_nonzero(value)?,
                "pex_size" => config.pex_size = parse_nonzero(value)?,
                "loglevel" => {
                    config.log_level =
                        LevelFilter::from_str(value).map_err(|_e| KernelError::InvalidInput)?;
                }
                _ => log::warn!("unknown cmdline parameter {key:?}"),
            }
        }
        Ok(config)
    }
}

fn parse_nonzero(value: &str) -> Result<usize, KernelError> {
    match value.parse::<usize>() {
        Ok(0) | Err(_) => Err(KernelError::InvalidInput),
        Ok(n) => Ok(n),
    }
}
