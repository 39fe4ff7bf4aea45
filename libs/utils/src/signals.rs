//! Blocking signal handling for the daemon's main thread.
//!
//! The scanner, upload worker, and HTTP prewarmers all run on their own
//! threads; the main thread's only job after startup is to block here and
//! react to a shutdown request.

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
        }
    }
}

pub struct Signals {
    handle: signal_hook::iterator::Handle,
    thread: std::thread::JoinHandle<()>,
    rx: std::sync::mpsc::Receiver<Signal>,
}

impl Signals {
    /// Blocks until a signal arrives, then invokes `handler`. Most handlers
    /// never return (they call `std::process::exit` or otherwise tear the
    /// process down); the few that do return cause `handle` to loop back
    /// and wait for the next signal.
    pub fn handle<F>(self, mut handler: F) -> anyhow::Result<()>
    where
        F: FnMut(Signal),
    {
        loop {
            match self.rx.recv() {
                Ok(signal) => handler(signal),
                Err(_) => {
                    // Signal thread exited; nothing more will ever arrive.
                    self.handle.close();
                    let _ = self.thread.join();
                    return Ok(());
                }
            }
        }
    }
}

/// Spawns a background thread that owns the process's signal mask and
/// forwards SIGINT/SIGTERM/SIGQUIT to a channel the caller polls from
/// [`Signals::handle`].
pub fn install_shutdown_handlers() -> anyhow::Result<Signals> {
    use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::iterator::Signals as RawSignals;

    let mut raw = RawSignals::new([SIGINT, SIGTERM, SIGQUIT])
        .context("failed to install signal handlers")?;
    let handle = raw.handle();
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::Builder::new()
        .name("signal-handler".to_owned())
        .spawn(move || {
            for raw_signal in &mut raw {
                let signal = match raw_signal {
                    SIGINT => Signal::Interrupt,
                    SIGTERM => Signal::Terminate,
                    SIGQUIT => Signal::Quit,
                    _ => continue,
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn signal-handler thread")?;

    Ok(Signals { handle, thread, rx })
}
