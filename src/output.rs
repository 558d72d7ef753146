use std::io::{self, Write};

use serde::Serialize;

use crate::app::{InstallResult, ListResult, ProgressEvent, ProgressSink, UninstallResult};
use crate::error::GgdError;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

/// Body printed when a request finds the prefix already in the desired state.
#[derive(Debug, Serialize)]
struct NoticeBody<'a> {
    status: &'static str,
    message: &'a str,
}

impl JsonOutput {
    pub fn print_install(result: &InstallResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_uninstall(result: &UninstallResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_notice(error: &GgdError) -> io::Result<()> {
        let message = error.to_string();
        Self::print_json(&NoticeBody {
            status: "unchanged",
            message: &message,
        })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
