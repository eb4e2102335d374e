//! Small helpers shared across the firmware: value scaling, note names
//! and the timer threads used by the power poller, the menu idle sweeper
//! and the power-off gesture.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MIDI_NOTES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Linear rescale with input clamping.
pub fn scale(value: f64, from_min: f64, from_max: f64, to_min: f64, to_max: f64) -> f64 {
    let value = value.clamp(from_min, from_max);
    let scaled = (value - from_min) / (from_max - from_min);
    to_min + scaled * (to_max - to_min)
}

pub fn midi2percent(val: i32) -> i32 {
    scale(val as f64, 0.0, 127.0, 0.0, 100.0).round() as i32
}

pub fn percent2midi(val: i32) -> i32 {
    scale(val as f64, 0.0, 100.0, 0.0, 127.0).round() as i32
}

/// Note name with relative octave, e.g. 60 -> "C", 48 -> "(-1) C".
pub fn midi2note(val: i32, with_octave: bool) -> String {
    if val < 0 {
        return "-".to_string();
    }
    let note = MIDI_NOTES[(val % 12) as usize];
    if !with_octave {
        return note.to_string();
    }
    let octave = val / 12 - 5;
    if octave == 0 {
        note.to_string()
    } else {
        format!("({}{}) {}", if octave > 0 { "+" } else { "" }, octave, note)
    }
}

/// Stereo balance to per-side amplitude: 64 is center (both 1.0), 0 hard
/// left, 127 hard right.
pub fn balance2amp(panning: i32, side: Side) -> f32 {
    let panning = panning.clamp(0, 127);
    match side {
        Side::Left => {
            if panning <= 64 {
                1.0
            } else {
                scale(panning as f64, 64.0, 127.0, 1.0, 0.0) as f32
            }
        }
        Side::Right => {
            if panning >= 64 {
                1.0
            } else {
                scale(panning as f64, 0.0, 64.0, 0.0, 1.0) as f32
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Microseconds since the epoch, the timestamp domain of input events.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A repeating timer thread. The callback runs once immediately, then once
/// per period until [`PeriodicTimer::stop`] is called or the timer is
/// dropped.
pub struct PeriodicTimer {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn start<F>(period: Duration, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("vielle-ptimer".to_string())
            .spawn(move || {
                callback();
                loop {
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => callback(),
                        _ => return,
                    }
                }
            })
            .expect("failed to spawn timer thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}

/// A cancelable single-shot timer, used by the power-off gesture.
pub struct OneShotTimer {
    cancel: Sender<()>,
}

impl OneShotTimer {
    pub fn start<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, canceled) = mpsc::channel();
        std::thread::Builder::new()
            .name("vielle-timer".to_string())
            .spawn(move || {
                if canceled.recv_timeout(delay) == Err(RecvTimeoutError::Timeout) {
                    callback();
                }
            })
            .expect("failed to spawn timer thread");
        Self { cancel }
    }

    pub fn cancel(self) {
        let _ = self.cancel.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_scale_clamps() {
        assert_eq!(scale(-5.0, 0.0, 100.0, 0.0, 10.0), 0.0);
        assert_eq!(scale(50.0, 0.0, 100.0, 0.0, 10.0), 5.0);
        assert_eq!(scale(200.0, 0.0, 100.0, 0.0, 10.0), 10.0);
    }

    #[test]
    fn test_midi_percent_roundtrip_endpoints() {
        assert_eq!(midi2percent(0), 0);
        assert_eq!(midi2percent(127), 100);
        assert_eq!(percent2midi(0), 0);
        assert_eq!(percent2midi(100), 127);
    }

    #[test]
    fn test_midi2note() {
        assert_eq!(midi2note(60, true), "C");
        assert_eq!(midi2note(61, false), "C#");
        assert_eq!(midi2note(-1, true), "-");
        assert_eq!(midi2note(48, true), "(-1) C");
        assert_eq!(midi2note(72, true), "(+1) C");
    }

    #[test]
    fn test_balance2amp_center() {
        assert_eq!(balance2amp(64, Side::Left), 1.0);
        assert_eq!(balance2amp(64, Side::Right), 1.0);
        assert_eq!(balance2amp(127, Side::Left), 0.0);
        assert_eq!(balance2amp(0, Side::Right), 0.0);
    }

    #[test]
    fn test_oneshot_cancel() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        let timer = OneShotTimer::start(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_oneshot_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        let _timer = OneShotTimer::start(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_timer_runs_and_stops() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let mut timer = PeriodicTimer::start(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        timer.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }
}
