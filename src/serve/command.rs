//! The command channel: one byte of shared state between the client's
//! input and the serving loop.
//!
//! Each byte read from the client becomes the current command and raises
//! the changed flag. Long-running emitters poll the flag between
//! pictures and unwind with the `CommandInterrupt` sentinel; the atomic
//! flag (held across skips) suppresses that check so a skip cannot be
//! torn by an intervening command.

use crate::error::{Result, TsKitError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

/// Normal play
pub const CMD_NORMAL: u8 = b'n';
/// Pause
pub const CMD_PAUSE: u8 = b'p';
/// Fast forward (all reference pictures)
pub const CMD_FAST: u8 = b'f';
/// Faster forward (intra pictures only)
pub const CMD_FASTER: u8 = b'F';
/// Reverse
pub const CMD_REVERSE: u8 = b'r';
/// Fast reverse
pub const CMD_FAST_REVERSE: u8 = b'R';
/// Skip forwards 10 seconds
pub const CMD_SKIP_FORWARD: u8 = b'>';
/// Skip backwards 10 seconds
pub const CMD_SKIP_BACKWARD: u8 = b'<';
/// Skip forwards 3 minutes
pub const CMD_SKIP_FORWARD_BIG: u8 = b']';
/// Skip backwards 3 minutes
pub const CMD_SKIP_BACKWARD_BIG: u8 = b'[';
/// Quit the worker
pub const CMD_QUIT: u8 = b'q';

/// True for bytes the control channel accepts.
pub fn is_valid_command(byte: u8) -> bool {
    matches!(
        byte,
        CMD_NORMAL
            | CMD_PAUSE
            | CMD_FAST
            | CMD_FASTER
            | CMD_REVERSE
            | CMD_FAST_REVERSE
            | CMD_SKIP_FORWARD
            | CMD_SKIP_BACKWARD
            | CMD_SKIP_FORWARD_BIG
            | CMD_SKIP_BACKWARD_BIG
            | CMD_QUIT
            | b'0'..=b'9'
    )
}

/// The writer-owned command slot. The only state shared between the
/// command reader, the producer and the drainer.
pub struct CommandState {
    command: AtomicU8,
    changed: AtomicBool,
    atomic: AtomicBool,
    notify: Notify,
}

impl CommandState {
    /// Creates a slot holding the pause command.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            command: AtomicU8::new(CMD_PAUSE),
            changed: AtomicBool::new(false),
            atomic: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Installs a new command byte and raises the changed flag.
    pub fn set(&self, byte: u8) {
        self.command.store(byte, Ordering::SeqCst);
        self.changed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// The current command byte.
    pub fn current(&self) -> u8 {
        self.command.load(Ordering::SeqCst)
    }

    /// Whether a new command has arrived since the flag was cleared.
    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Clears the changed flag; done before entering each state.
    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    /// Marks the start/end of an atomic region (skips): while set, the
    /// interrupt check is suppressed.
    pub fn set_atomic(&self, on: bool) {
        self.atomic.store(on, Ordering::SeqCst);
    }

    /// Whether an atomic region is active.
    pub fn is_atomic(&self) -> bool {
        self.atomic.load(Ordering::SeqCst)
    }

    /// The cooperative cancellation point: fails with the
    /// `CommandInterrupt` sentinel when a new command is pending and no
    /// atomic region suppresses it.
    pub fn check_interrupt(&self) -> Result<()> {
        if self.changed() && !self.is_atomic() {
            return Err(TsKitError::CommandInterrupt);
        }
        Ok(())
    }

    /// Waits until a new command arrives (PAUSED, and EOF rest states).
    pub async fn wait_changed(&self) {
        while !self.changed() {
            self.notify.notified().await;
        }
    }
}

/// Reads command bytes from the client into the slot until EOF or
/// error. A disconnect installs quit so the worker unwinds.
pub async fn read_commands<R>(mut input: R, cmd: Arc<CommandState>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        match input.read(&mut buf).await {
            Ok(0) => {
                log::info!("control channel closed by client");
                cmd.set(CMD_QUIT);
                return;
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    if is_valid_command(byte) {
                        log::debug!("command '{}'", byte as char);
                        cmd.set(byte);
                    } else if !byte.is_ascii_whitespace() {
                        log::warn!("ignoring unknown command byte 0x{:02x}", byte);
                    }
                }
            }
            Err(e) => {
                log::info!("control channel read failed: {}", e);
                cmd.set(CMD_QUIT);
                return;
            }
        }
    }
}
