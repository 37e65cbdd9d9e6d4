//! Wraps a `portable_pty` child process and keeps its window size in sync
//! with window-change requests coming in over the SSH channel, the Rust
//! counterpart of `pty_unix.go`/`winresize.go`.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to spawn pty: {0}")]
    Spawn(#[from] anyhow::Error),
}

pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Mutex<Box<dyn Write + Send>>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtySession {
    pub fn spawn(
        mut command: CommandBuilder,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, Box<dyn Read + Send>), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(anyhow::Error::from)?;

        command.cwd(std::env::current_dir()?);

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(anyhow::Error::from)?;

        let reader = pair.master.try_clone_reader().map_err(anyhow::Error::from)?;
        let writer = pair.master.take_writer().map_err(anyhow::Error::from)?;

        Ok((
            Self {
                master: pair.master,
                writer: Mutex::new(writer),
                child,
            },
            reader,
        ))
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
    }

    pub fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        self.writer.lock().unwrap().write_all(data)
    }
}

/// A clonable handle so the window-resize task and the stdin-forwarding
/// task can both reach the same underlying pty.
pub type SharedPty = Arc<PtySession>;
