//! Subgraph FIFO pool.
//!
//! One named FIFO per execution-order slot, created on demand and held
//! open read-write so that neither end ever observes EOF while clients
//! come and go. The engine writes one byte to a subgraph head's FIFO to
//! start it and drains one byte from the tail's to conclude it; clients
//! chain through the intermediate slots.

use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub struct FifoPool {
    prefix: PathBuf,
    fifos: Vec<Option<File>>,
}

impl FifoPool {
    /// `prefix` is the full path stem; slot `n` lives at `<prefix>-<n>`.
    pub fn new(prefix: PathBuf) -> Self {
        Self {
            prefix,
            fifos: Vec::new(),
        }
    }

    pub fn path_for(&self, n: u32) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push(format!("-{n}"));
        PathBuf::from(name)
    }

    /// Fd for slot `n`, creating and opening the FIFO on first use.
    pub fn get(&mut self, n: u32) -> std::io::Result<i32> {
        let idx = n as usize;
        if idx >= self.fifos.len() {
            self.fifos.resize_with(idx + 1, || None);
        }

        if self.fifos[idx].is_none() {
            let path = self.path_for(n);
            ensure_fifo(&path)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&path)?;
            self.fifos[idx] = Some(file);
        }

        Ok(self.fifos[idx].as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1))
    }

    /// Drain stray bytes left by aborted clients. There are only ever a
    /// couple in flight; 16 is generous.
    pub fn clear(&mut self) {
        let mut buf = [0u8; 16];
        for fifo in self.fifos.iter_mut().flatten() {
            match fifo.read(&mut buf) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => tracing::warn!(error = %e, "cannot drain subgraph fifo"),
            }
        }
    }

    /// Unlink every FIFO created so far. Called on engine teardown; the
    /// startup cleanup pass catches anything a crash leaves behind.
    pub fn unlink_all(&mut self) {
        for n in 0..self.fifos.len() as u32 {
            if self.fifos[n as usize].is_some() {
                let _ = std::fs::remove_file(self.path_for(n));
            }
        }
        self.fifos.clear();
    }
}

fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_fifo() {
                Ok(())
            } else {
                Err(std::io::Error::other(format!(
                    "{} exists but is not a FIFO",
                    path.display()
                )))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666))
                .map_err(std::io::Error::from)
        }
        Err(e) => Err(e),
    }
}
