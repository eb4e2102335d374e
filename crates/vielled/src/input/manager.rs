//! The input poll loop.
//!
//! One dedicated thread owns every registered source and a poll
//! selector over their file descriptors. Mapped events go to the
//! dispatcher queue. Sources can be registered and unregistered from
//! other threads (the MIDI controller does this on hotplug) through a
//! command channel that the loop drains between poll rounds.

use std::os::unix::io::RawFd;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::events::Event;
use crate::input::{InputError, InputSource};

const POLL_TIMEOUT_MS: i32 = 1000;
const IDLE_SLEEP: Duration = Duration::from_millis(500);

enum Command {
    Register(Box<dyn InputSource>),
    Unregister(String),
    Stop,
}

struct Registered {
    source: Box<dyn InputSource>,
    fd: RawFd,
}

/// Handle to the input thread.
pub struct InputManager {
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl InputManager {
    /// Spawn the poll thread; mapped events are sent to `queue`.
    pub fn start(queue: Sender<Event>) -> Self {
        let (commands, command_rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("vielle-input".to_string())
            .spawn(move || poll_loop(command_rx, queue))
            .expect("failed to spawn input thread");
        Self {
            commands,
            handle: Some(handle),
        }
    }

    /// Hand a source to the poll thread. It is opened there; open
    /// failures are logged, not returned.
    pub fn register(&self, source: Box<dyn InputSource>) {
        let _ = self.commands.send(Command::Register(source));
    }

    pub fn unregister(&self, filename: &str) {
        let _ = self.commands.send(Command::Unregister(filename.to_string()));
    }

    pub fn stop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InputManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
    }
}

fn poll_loop(commands: Receiver<Command>, queue: Sender<Event>) {
    let mut sources: Vec<Registered> = Vec::new();

    loop {
        // drain pending registration commands
        loop {
            let command = if sources.is_empty() {
                // nothing to poll; block on the command channel instead
                // of busy-spinning
                match commands.recv_timeout(IDLE_SLEEP) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            } else {
                match commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => break,
                }
            };
            match command {
                Command::Stop => return,
                Command::Register(source) => register(&mut sources, source, &queue),
                Command::Unregister(filename) => unregister(&mut sources, &filename),
            }
        }

        if sources.is_empty() {
            continue;
        }

        let mut fds: Vec<libc::pollfd> = sources
            .iter()
            .map(|entry| libc::pollfd {
                fd: entry.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!("poll failed: {}", err);
                std::thread::sleep(IDLE_SLEEP);
            }
            continue;
        }
        if ready == 0 {
            continue;
        }

        let mut gone = Vec::new();
        for (idx, pollfd) in fds.iter().enumerate() {
            if pollfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                continue;
            }
            let entry = &mut sources[idx];
            if let Err(filename) = drain_source(entry, &queue) {
                gone.push(filename);
            }
        }
        for filename in gone {
            unregister(&mut sources, &filename);
        }
    }
}

fn register(sources: &mut Vec<Registered>, mut source: Box<dyn InputSource>, queue: &Sender<Event>) {
    if sources.iter().any(|e| e.source.filename() == source.filename()) {
        error!("handler for \"{}\" already registered!", source.filename());
        return;
    }
    match source.open() {
        Ok(fd) => {
            for event in source.initial_events() {
                let _ = queue.send(event);
            }
            debug!("registered input source {}", source.name());
            sources.push(Registered { source, fd });
        }
        Err(e) => error!("unable to open input \"{}\": {}", source.filename(), e),
    }
}

fn unregister(sources: &mut Vec<Registered>, filename: &str) {
    match sources.iter().position(|e| e.source.filename() == filename) {
        Some(idx) => {
            let mut entry = sources.remove(idx);
            entry.source.close();
            debug!("unregistered input source {}", filename);
        }
        None => warn!("no handler registered for input \"{}\"", filename),
    }
}

/// Drain one ready source completely. Returns Err(filename) when the
/// device is gone and the source must be unregistered.
fn drain_source(entry: &mut Registered, queue: &Sender<Event>) -> Result<(), String> {
    loop {
        let records = match entry.source.read() {
            Ok(records) => records,
            Err(e) if e.is_device_gone() => {
                warn!("input device {} vanished", entry.source.filename());
                return Err(entry.source.filename().to_string());
            }
            Err(e) => {
                error!("error reading from {}: {}", entry.source.name(), e);
                return Ok(());
            }
        };
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            match entry.source.map(&record) {
                Some(event) => {
                    let _ = queue.send(event);
                }
                None => {
                    if entry.source.debug() {
                        debug!("missing mapping in {} for {:?}", entry.source.name(), record);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Action, Event, Key};
    use crate::input::RawRecord;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Source over a plain file: always readable, EOF after content.
    struct FileSource {
        inner: crate::input::evdev::EvDevInput,
    }

    impl InputSource for FileSource {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn filename(&self) -> &str {
            self.inner.filename()
        }

        fn open(&mut self) -> Result<RawFd, InputError> {
            self.inner.open()
        }

        fn close(&mut self) {
            self.inner.close()
        }

        fn read(&mut self) -> Result<Vec<RawRecord>, InputError> {
            self.inner.read()
        }

        fn map(&mut self, record: &RawRecord) -> Option<Event> {
            self.inner.map(record)
        }
    }

    /// Source whose read always reports a vanished device.
    struct GoneSource {
        file: Option<std::fs::File>,
        path: String,
        closed: Arc<AtomicBool>,
    }

    impl InputSource for GoneSource {
        fn name(&self) -> &str {
            "gone"
        }

        fn filename(&self) -> &str {
            &self.path
        }

        fn open(&mut self) -> Result<RawFd, InputError> {
            use std::os::unix::io::AsRawFd;
            let file = std::fs::File::open(&self.path)?;
            let fd = file.as_raw_fd();
            self.file = Some(file);
            Ok(fd)
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.file = None;
        }

        fn read(&mut self) -> Result<Vec<RawRecord>, InputError> {
            Err(InputError::Io(std::io::Error::from_raw_os_error(
                libc::ENODEV,
            )))
        }

        fn map(&mut self, _record: &RawRecord) -> Option<Event> {
            None
        }
    }

    fn write_event_file(dir: &tempfile::TempDir) -> String {
        use crate::input::evdev::EvDevRecord;
        let path = dir.path().join("events");
        let record = EvDevRecord {
            secs: 5,
            usecs: 0,
            kind: 1,
            code: 28,
            value: 1,
        };
        std::fs::write(&path, record.to_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_events_flow_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_event_file(&dir);

        let mut source = crate::input::evdev::EvDevInput::new(&path, "keys", false);
        source
            .set_mappings(&[serde_json::json!({
                "input": {"type": 1, "code": 28, "value": 1},
                "event": {"type": "input", "name": "select", "action": "down"}
            })])
            .unwrap();

        let (tx, rx) = unbounded();
        let mut manager = InputManager::start(tx);
        manager.register(Box::new(FileSource { inner: source }));

        let event = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        match event {
            Event::Input(ev) => {
                assert_eq!(ev.key, Key::Select);
                assert_eq!(ev.action, Action::Down);
            }
            other => panic!("unexpected event {:?}", other),
        }
        manager.stop();
    }

    #[test]
    fn test_enodev_self_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        std::fs::write(&path, "x").unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let source = GoneSource {
            file: None,
            path: path.to_str().unwrap().to_string(),
            closed: Arc::clone(&closed),
        };

        let (tx, _rx) = unbounded();
        let mut manager = InputManager::start(tx);
        manager.register(Box::new(source));

        // the source reports ENODEV on first read and must be closed
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !closed.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(closed.load(Ordering::SeqCst));
        manager.stop();
    }
}
