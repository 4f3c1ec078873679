//! Command-line parsing shared by both binaries.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub config: PathBuf,
    /// Write a template configuration and exit.
    pub template: bool,
    /// Poll interval override in seconds (`stbstation` only).
    pub rate: Option<u64>,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            config: PathBuf::from(DEFAULT_CONFIG_FILE),
            template: false,
            rate: None,
        }
    }
}

/// Parse arguments (without the program name). `accept_rate` enables `--rate`.
pub fn parse<I>(args: I, accept_rate: bool) -> Result<Args, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Args::default();
    let mut config_seen = false;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
            _ => (arg, None),
        };

        match flag.as_str() {
            "--config" => {
                if config_seen {
                    return Err("`--config` provided more than once".to_string());
                }
                config_seen = true;
                out.config = PathBuf::from(value_for(&flag, inline, &mut args)?);
            }
            "--rate" if accept_rate => {
                let raw = value_for(&flag, inline, &mut args)?;
                let secs = raw
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("`--rate` must be a positive number of seconds, got {:?}", raw))?;
                out.rate = Some(secs);
            }
            "--template" if inline.is_none() => out.template = true,
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        }
    }

    Ok(out)
}

fn value_for<I>(flag: &str, inline: Option<String>, rest: &mut I) -> Result<String, String>
where
    I: Iterator<Item = OsString>,
{
    let value = match inline {
        Some(v) => v,
        None => rest
            .next()
            .ok_or_else(|| format!("`{}` requires an argument", flag))?
            .into_string()
            .map_err(|_| format!("`{}` argument contains invalid UTF-8", flag))?,
    };
    if value.is_empty() {
        return Err(format!("`{}` requires an argument", flag));
    }
    Ok(value)
}
