//! Dot ticker shown while a payload is being unpacked.

use std::{
    io::Write,
    sync::mpsc::{channel, RecvTimeoutError, Sender},
    thread::{spawn, JoinHandle},
    time::Duration,
};


pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

pub struct Progress {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Progress {
    /// Writes `message` once, then a `.` every `interval` until stopped.
    pub fn start<W>(message: &str, interval: Duration, mut sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        let _ = write!(sink, "{message}");
        let _ = sink.flush();
        let (tx, rx) = channel::<()>();
        let handle = spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = write!(sink, ".");
                        let _ = sink.flush();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            let _ = writeln!(sink);
            let _ = sink.flush();
        });
        Progress { stop: Some(tx), handle: Some(handle) }
    }

    /// Signals the ticker and waits for its final newline.
    pub fn stop(mut self) {
        self.finish()
    }

    fn finish(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.finish()
    }
}
