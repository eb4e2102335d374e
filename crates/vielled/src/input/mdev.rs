//! Hotplug notifications from mdev via a named pipe.
//!
//! The device manager appends lines of the form
//! `"<action> <source> <subsystem> <device>"`. If a previous boot left a
//! regular file behind, its content is replayed as initial events before
//! the fifo is (re)created.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::RawFd;

use tracing::{error, warn};

use crate::events::Event;
use crate::input::{open_nonblocking, InputError, InputSource, RawRecord};

pub struct MdevInput {
    name: String,
    filename: String,
    file: Option<File>,
    initial: Vec<Event>,
}

impl MdevInput {
    pub fn new(filename: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            file: None,
            initial: Vec::new(),
        }
    }

    fn parse_line(&self, line: &str) -> Option<Event> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 4 {
            error!("invalid mdev event line: {}", line);
            return None;
        }
        Some(Event::Mdev {
            action: tokens[0].to_string(),
            source: tokens[1].to_string(),
            subsystem: tokens[2].to_string(),
            device: tokens[3].to_string(),
        })
    }

    fn is_fifo(&self) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&self.filename)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false)
    }

    fn read_initial_events(&mut self) {
        let Ok(data) = std::fs::read_to_string(&self.filename) else {
            return;
        };
        self.initial = data
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| self.parse_line(line))
            .collect();
    }

    fn create_fifo(&self) -> Result<(), InputError> {
        for attempt in 0..10 {
            if std::path::Path::new(&self.filename).is_file() {
                let _ = std::fs::remove_file(&self.filename);
            }
            if self.is_fifo() {
                return Ok(());
            }
            let path = CString::new(self.filename.as_bytes())
                .map_err(|_| InputError::InvalidMap(format!("bad fifo path {}", self.filename)))?;
            let rc = unsafe { libc::mkfifo(path.as_ptr(), 0o644) };
            if rc == 0 || self.is_fifo() {
                return Ok(());
            }
            warn!(
                "unable to create mdev fifo (attempt {}): {}",
                attempt,
                std::io::Error::last_os_error()
            );
        }
        Err(InputError::Io(std::io::Error::other(
            "failed to create mdev fifo, giving up",
        )))
    }
}

impl InputSource for MdevInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn open(&mut self) -> Result<RawFd, InputError> {
        if !self.is_fifo() {
            self.read_initial_events();
        }
        self.create_fifo()?;
        // O_RDWR keeps the fifo open across writer exits
        let (file, fd) = open_nonblocking(&self.filename, true)?;
        self.file = Some(file);
        Ok(fd)
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn initial_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.initial)
    }

    fn read(&mut self) -> Result<Vec<RawRecord>, InputError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        let mut raw = Vec::new();
        loop {
            let mut buf = [0u8; 4096];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(String::from_utf8_lossy(&raw)
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| RawRecord::Line(line.to_string()))
            .collect())
    }

    fn map(&mut self, record: &RawRecord) -> Option<Event> {
        let RawRecord::Line(line) = record else {
            return None;
        };
        self.parse_line(line)
    }
}
