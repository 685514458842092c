//! Plugin parameter string parsing
//!
//! The host passes a single string such as `--rate=2048000 --index=0`. It is
//! split on whitespace and parsed as a command line, so both `--key=value`
//! and `--key value` work and unknown keys are rejected.

use std::str::FromStr;

use clap::Parser;

use crate::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "TSDRPlugin_RTLSDR",
    about = "RTL-SDR acquisition plugin",
    no_binary_name = true,
    disable_version_flag = true
)]
struct InitArgs {
    /// Rate of incoming samples
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    rate: Option<u32>,

    /// Device index
    #[arg(long, default_value_t = 0)]
    index: u32,

    /// IF filter bandwidth in Hz
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    bw: Option<u32>,
}

/// Parsed `init` parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitParams {
    /// Requested sample rate; `None` keeps the configured default
    pub rate: Option<u32>,
    pub index: u32,
    /// IF filter bandwidth; only applied when given
    pub bandwidth: Option<u32>,
}

impl InitParams {
    pub fn parse(params: &str) -> Result<Self> {
        let args = InitArgs::try_parse_from(params.split_whitespace())
            .map_err(|e| Error::ParametersWrong(e.render().to_string()))?;
        Ok(Self {
            rate: args.rate,
            index: args.index,
            bandwidth: args.bw,
        })
    }
}

impl FromStr for InitParams {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
