//! Interactive stream forwarding between the local terminal and a session

use std::io::IsTerminal;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Result, SshError};
use crate::k8s::AttachedSession;

/// Local ends of the interactive session
pub struct TerminalStreams<I, O, E> {
    pub stdin: I,
    pub stdout: O,
    pub stderr: E,
    /// Switch the controlling terminal to raw mode while attached
    pub raw_mode: bool,
}

impl TerminalStreams<tokio::io::Stdin, tokio::io::Stdout, tokio::io::Stderr> {
    /// The process' own standard streams
    pub fn stdio() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
            stderr: tokio::io::stderr(),
            raw_mode: std::io::stdin().is_terminal(),
        }
    }
}

/// Puts the controlling terminal in raw mode for as long as it is held.
///
/// Keystrokes such as Ctrl-C then reach the remote shell instead of this
/// process.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    pub fn acquire() -> Self {
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                warn!(error = %e, "Failed to switch terminal to raw mode");
                Self { enabled: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            restore_terminal(crossterm::terminal::disable_raw_mode());
        }
    }
}

/// Report a failed switch back to cooked mode; returns whether it succeeded
fn restore_terminal(result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to restore terminal mode, run `reset` to recover");
            false
        }
    }
}

/// Forward `input` to the session's stdin and its output to `output` until
/// the remote side closes its output, then report the remote outcome.
///
/// Local EOF closes the remote stdin; the session keeps running until the
/// remote shell exits.
pub async fn pump<I, O>(name: &str, session: AttachedSession, mut input: I, mut output: O) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let AttachedSession {
        stdin: mut remote_stdin,
        stdout: mut remote_stdout,
        done,
    } = session;

    let attach_error = |e: std::io::Error| SshError::Attach {
        name: name.to_string(),
        message: e.to_string(),
    };

    {
        let upstream = async {
            tokio::io::copy(&mut input, &mut remote_stdin).await?;
            remote_stdin.shutdown().await
        };
        let downstream = tokio::io::copy(&mut remote_stdout, &mut output);
        tokio::pin!(upstream, downstream);

        let mut input_open = true;
        loop {
            tokio::select! {
                res = &mut downstream => {
                    let bytes = res.map_err(attach_error)?;
                    debug!(name, bytes, "Session output closed");
                    break;
                }
                res = &mut upstream, if input_open => {
                    input_open = false;
                    match res {
                        Ok(()) => debug!(name, "Local input closed"),
                        Err(e) => debug!(name, error = %e, "Input forwarding stopped"),
                    }
                }
            }
        }
    }

    output.flush().await.map_err(attach_error)?;
    done.await
}
