//! Background reader and modem-status poller for an open port.

use super::worker::Command;
use crate::port::{PinState, SerialPortAdapter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handles to the threads servicing one open session.
#[derive(Debug)]
pub(crate) struct IoThreads {
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    poller: JoinHandle<()>,
}

pub(crate) struct IoConfig {
    pub path: String,
    pub chunk_size: usize,
    pub poll_interval: Duration,
    pub initial_pins: PinState,
}

impl IoThreads {
    pub(crate) fn spawn(
        config: IoConfig,
        reader: Box<dyn SerialPortAdapter>,
        poller: Box<dyn SerialPortAdapter>,
        stop: Arc<AtomicBool>,
        commands: Sender<Command>,
    ) -> io::Result<Self> {
        let reader_handle = {
            let stop = stop.clone();
            let commands = commands.clone();
            let path = config.path.clone();
            let chunk_size = config.chunk_size.max(1);
            let poll_interval = config.poll_interval;
            thread::Builder::new()
                .name(format!("serial-read {}", config.path))
                .spawn(move || read_loop(path, reader, chunk_size, poll_interval, stop, commands))?
        };

        let poller_handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("serial-pins {}", config.path))
                .spawn(move || {
                    poll_loop(
                        config.path,
                        poller,
                        config.poll_interval,
                        config.initial_pins,
                        stop,
                        commands,
                    )
                })
        };

        match poller_handle {
            Ok(poller) => Ok(Self {
                stop,
                reader: reader_handle,
                poller,
            }),
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                let _ = reader_handle.join();
                Err(e)
            }
        }
    }

    /// Ask both threads to exit and wait for them.
    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.reader.join().is_err() {
            warn!("Serial reader thread panicked");
        }
        if self.poller.join().is_err() {
            warn!("Modem status poller thread panicked");
        }
    }
}

fn read_loop(
    path: String,
    mut device: Box<dyn SerialPortAdapter>,
    chunk_size: usize,
    backoff: Duration,
    stop: Arc<AtomicBool>,
    commands: Sender<Command>,
) {
    debug!(path = %path, "Reader started");
    let mut buffer = vec![0u8; chunk_size];
    let mut failing = false;

    while !stop.load(Ordering::SeqCst) {
        match device.read_bytes(&mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                failing = false;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if commands.send(Command::Received(buffer[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.is_timeout() => {}
            Err(e) if e.is_device_gone() => {
                if !stop.load(Ordering::SeqCst) {
                    let _ = commands.send(Command::DeviceGone { error: e });
                }
                break;
            }
            Err(e) => {
                if !failing {
                    failing = true;
                    warn!(path = %path, error = %e, "Serial read failed");
                    let _ = commands.send(Command::ReadFailed { error: e });
                }
                thread::sleep(backoff);
            }
        }
    }
    debug!(path = %path, "Reader stopped");
}

fn poll_loop(
    path: String,
    mut device: Box<dyn SerialPortAdapter>,
    interval: Duration,
    mut last: PinState,
    stop: Arc<AtomicBool>,
    commands: Sender<Command>,
) {
    debug!(path = %path, interval_ms = interval.as_millis() as u64, "Pin poller started");
    let mut failing = false;

    while !stop.load(Ordering::SeqCst) {
        match device.read_pins() {
            Ok(pins) => {
                failing = false;
                if pins != last {
                    last = pins;
                    if commands.send(Command::PinsChanged(pins)).is_err() {
                        break;
                    }
                }
            }
            Err(e) if e.is_status_read_gone() => {
                if !stop.load(Ordering::SeqCst) {
                    let _ = commands.send(Command::DeviceGone { error: e });
                }
                break;
            }
            Err(e) => {
                if !failing {
                    failing = true;
                    debug!(path = %path, error = %e, "Reading modem status lines failed");
                }
            }
        }
        thread::sleep(interval);
    }
    debug!(path = %path, "Pin poller stopped");
}
