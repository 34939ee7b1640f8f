//! Frontend-facing invocation surface.
//!
//! The tray frontend drives the helper through exactly two privileged
//! invocations, implemented here: a fire-and-forget connect and a
//! blocking disconnect, both escalated through pkexec. Running the
//! binary with no arguments enters a minimal line-driven frontend that
//! dispatches the same commands, so the helper is usable without a tray.

use anyhow::Result;
use std::io::BufRead;
use std::process::Command;
use tracing::{error, info};

/// A command the frontend can dispatch to the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrontendCommand {
    Connect,
    Disconnect,
    Quit,
}

fn parse_command(line: &str) -> Option<FrontendCommand> {
    match line.trim() {
        "connect" => Some(FrontendCommand::Connect),
        "disconnect" => Some(FrontendCommand::Disconnect),
        "quit" | "exit" => Some(FrontendCommand::Quit),
        _ => None,
    }
}

/// Start a session; does not wait for the helper, which runs until the
/// session is torn down.
pub fn request_connect() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    Command::new("pkexec").arg(exe).arg("--connect").spawn()?;
    Ok(())
}

/// Stop the session; waits for the helper so the caller knows cleanup
/// has been attempted.
pub fn request_disconnect() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let status = Command::new("pkexec").arg(exe).arg("--disconnect").status()?;
    if !status.success() {
        info!(%status, "disconnect helper reported failure");
    }
    Ok(())
}

/// Line-driven frontend loop: `connect`, `disconnect`, `quit`.
pub fn run() -> Result<()> {
    println!("shroud frontend - commands: connect | disconnect | quit");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(FrontendCommand::Connect) => {
                info!("requesting session start");
                if let Err(e) = request_connect() {
                    error!(error = %e, "failed to launch helper");
                }
            }
            Some(FrontendCommand::Disconnect) => {
                info!("requesting session stop");
                if let Err(e) = request_disconnect() {
                    error!(error = %e, "failed to run disconnect");
                }
            }
            Some(FrontendCommand::Quit) => {
                // mirror the tray's quit behavior: disconnect, then leave
                if let Err(e) = request_disconnect() {
                    error!(error = %e, "failed to run disconnect");
                }
                break;
            }
            None => println!("unknown command: {}", line.trim()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_surrounding_whitespace() {
        assert_eq!(parse_command("  connect "), Some(FrontendCommand::Connect));
        assert_eq!(parse_command("disconnect"), Some(FrontendCommand::Disconnect));
        assert_eq!(parse_command("quit"), Some(FrontendCommand::Quit));
        assert_eq!(parse_command("exit"), Some(FrontendCommand::Quit));
        assert_eq!(parse_command("restart"), None);
    }
}
