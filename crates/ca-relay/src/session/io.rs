//! Blocking byte pumps between a pseudo-terminal master and async channels
//!
//! The pty handles are blocking `Read`/`Write` objects, so each direction
//! runs on its own blocking task. Exactly one task owns each handle, which
//! keeps bytes in order without any locking.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::manager::PtySession;

/// Read size for pty output
const READ_CHUNK: usize = 4096;

/// Forward process output into `tx` until EOF or until the receiver is dropped
///
/// Marks the session active on the first byte.
pub fn spawn_pty_reader(
    session: Arc<PtySession>,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Bytes>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let id = session.id();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader EOF for {}", id);
                    break;
                }
                Ok(n) => {
                    session.mark_active();
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        tracing::debug!("PTY output channel closed for {}", id);
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO on the master once the last slave fd closes.
                    if e.kind() == std::io::ErrorKind::Other
                        || e.kind() == std::io::ErrorKind::BrokenPipe
                        || e.raw_os_error() == Some(5)
                    {
                        tracing::debug!("PTY reader closed for {}: {}", id, e);
                    } else {
                        tracing::error!("PTY read error for {}: {}", id, e);
                    }
                    break;
                }
            }
        }
    })
}

/// Write everything received on `rx` to the process input, in order
///
/// Ends when the sender is dropped or a write fails; a failed write drops
/// `rx`, which the sending side observes as a closed channel.
pub fn spawn_pty_writer(
    session: Arc<PtySession>,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Bytes>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let id = session.id();
        while let Some(data) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                tracing::debug!("PTY write failed for {}: {}", id, e);
                break;
            }
        }
        tracing::debug!("PTY writer exiting for {}", id);
    })
}
