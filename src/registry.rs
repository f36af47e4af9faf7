//! Device discovery and the set of known ports.
//!
//! A [`PortRegistry`] owns one [`Port`] per device path. It learns about
//! devices by polling a [`DeviceEnumerator`] ([`PortRegistry::refresh`] or a
//! background [`RegistryWatcher`]) or by being told directly through
//! [`PortRegistry::handle_arrivals`] and [`PortRegistry::handle_removals`].
//! Subscribers receive [`RegistryEvent`]s naming the ports that came and went.

use crate::config::{Config, EngineConfig, RegistryConfig};
use crate::engine::{default_display_name, EventDispatcher, Port, PortState};
use crate::port::{DeviceOpener, PortError, PortSettings, SystemOpener};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

fn is_live(port: &Port) -> bool {
    port.state() != PortState::Removed
}

/// A device as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// Lists the serial devices currently present.
pub trait DeviceEnumerator: Send + Sync + std::fmt::Debug {
    fn devices(&self) -> Result<Vec<DeviceInfo>, PortError>;
}

/// Enumerates devices through `serialport::available_ports`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnumerator;

impl DeviceEnumerator for SystemEnumerator {
    fn devices(&self) -> Result<Vec<DeviceInfo>, PortError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|info| {
                let name = match &info.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .unwrap_or_else(|| default_display_name(&info.port_name)),
                    _ => default_display_name(&info.port_name),
                };
                DeviceInfo::new(info.port_name, name)
            })
            .collect())
    }
}

/// Ports appearing or disappearing.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    PortsConnected(Vec<Arc<Port>>),
    PortsDisconnected(Vec<Arc<Port>>),
}

struct RegistryInner {
    enumerator: Box<dyn DeviceEnumerator>,
    opener: Arc<dyn DeviceOpener>,
    config: RegistryConfig,
    settings: PortSettings,
    engine: EngineConfig,
    events: EventDispatcher,
    ports: Mutex<BTreeMap<String, Arc<Port>>>,
    sleeping: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<mpsc::Sender<RegistryEvent>>>,
}

/// The set of known ports, keyed by device path.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct PortRegistry {
    inner: Arc<RegistryInner>,
}

impl PortRegistry {
    /// Create an empty registry. New ports get `config`'s line settings and
    /// engine tuning, and emit into `events`.
    pub fn new(
        enumerator: impl DeviceEnumerator + 'static,
        opener: Arc<dyn DeviceOpener>,
        config: &Config,
        events: EventDispatcher,
    ) -> Result<Self, PortError> {
        let settings = config
            .serial
            .to_port_settings()
            .map_err(|e| PortError::config(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                enumerator: Box::new(enumerator),
                opener,
                config: config.registry.clone(),
                settings,
                engine: config.engine.clone(),
                events,
                ports: Mutex::new(BTreeMap::new()),
                sleeping: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// A registry over the real system devices, populated with an initial scan.
    pub fn system(config: &Config, events: EventDispatcher) -> Result<Self, PortError> {
        let opener = Arc::new(SystemOpener::new(config.engine.read_timeout()));
        let registry = Self::new(SystemEnumerator, opener, config, events)?;
        registry.refresh()?;
        Ok(registry)
    }

    /// Receive future connect/disconnect events.
    pub fn subscribe(&self) -> mpsc::Receiver<RegistryEvent> {
        let (sender, receiver) = mpsc::channel();
        self.inner.subscribers.lock().push(sender);
        receiver
    }

    fn publish(&self, event: RegistryEvent) {
        self.inner
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// All known ports, ordered by path.
    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.inner.ports.lock().values().cloned().collect()
    }

    pub fn port(&self, path: &str) -> Option<Arc<Port>> {
        self.inner.ports.lock().get(path).cloned()
    }

    fn build_port(&self, path: &str, name: &str) -> Result<Arc<Port>, PortError> {
        let name = self.inner.config.alias(path).unwrap_or(name);
        let port = Port::builder(path)
            .name(name)
            .settings(self.inner.settings.clone())
            .engine(self.inner.engine.clone())
            .shared_opener(self.inner.opener.clone())
            .events(self.inner.events.clone())
            .build()?;
        Ok(Arc::new(port))
    }

    /// The port for `path`, creating it if the registry does not track it
    /// yet. A tracked port whose device was lost is replaced and reported
    /// as disconnected.
    pub fn get_or_insert(&self, path: &str) -> Result<Arc<Port>, PortError> {
        let (port, replaced) = {
            let mut ports = self.inner.ports.lock();
            if let Some(port) = ports.get(path).filter(|p| is_live(p)) {
                return Ok(port.clone());
            }
            let port = self.build_port(path, &default_display_name(path))?;
            let replaced = ports.insert(path.to_string(), port.clone());
            (port, replaced)
        };
        if let Some(old) = replaced {
            self.inner.sleeping.lock().retain(|p| p != path);
            debug!(path = %path, "Replacing lost serial port");
            self.publish(RegistryEvent::PortsDisconnected(vec![old]));
        }
        Ok(port)
    }

    /// Start tracking devices that appeared. Excluded paths and paths with a
    /// live port are skipped; a port already moved to `Removed` is replaced
    /// and reported as disconnected first. Returns the newly created ports.
    pub fn handle_arrivals(&self, devices: &[DeviceInfo]) -> Vec<Arc<Port>> {
        let mut added = Vec::new();
        let mut replaced = Vec::new();
        {
            let mut ports = self.inner.ports.lock();
            for device in devices {
                if self.inner.config.is_excluded(&device.path)
                    || ports.get(&device.path).is_some_and(|p| is_live(p))
                {
                    continue;
                }
                match self.build_port(&device.path, &device.name) {
                    Ok(port) => {
                        if let Some(old) = ports.insert(device.path.clone(), port.clone()) {
                            replaced.push(old);
                        }
                        added.push(port);
                    }
                    Err(e) => {
                        warn!(path = %device.path, error = %e, "Could not track serial port")
                    }
                }
            }
        }

        if !replaced.is_empty() {
            self.inner
                .sleeping
                .lock()
                .retain(|path| !replaced.iter().any(|p| p.path() == path.as_str()));
            info!(
                ports = ?replaced.iter().map(|p| p.path()).collect::<Vec<_>>(),
                "Replacing lost serial ports"
            );
            self.publish(RegistryEvent::PortsDisconnected(replaced));
        }
        if !added.is_empty() {
            info!(
                ports = ?added.iter().map(|p| p.path()).collect::<Vec<_>>(),
                "Serial ports connected"
            );
            self.publish(RegistryEvent::PortsConnected(added.clone()));
        }
        added
    }

    /// Stop tracking devices that went away, tearing down any that are open.
    /// Returns the ports that were removed.
    pub fn handle_removals(&self, paths: &[String]) -> Vec<Arc<Port>> {
        let removed: Vec<_> = {
            let mut ports = self.inner.ports.lock();
            paths.iter().filter_map(|path| ports.remove(path)).collect()
        };
        if removed.is_empty() {
            return removed;
        }

        self.inner
            .sleeping
            .lock()
            .retain(|path| !paths.contains(path));
        for port in &removed {
            port.mark_removed();
        }

        info!(
            ports = ?removed.iter().map(|p| p.path()).collect::<Vec<_>>(),
            "Serial ports disconnected"
        );
        self.publish(RegistryEvent::PortsDisconnected(removed.clone()));
        removed
    }

    /// Rescan the enumerator and reconcile. Ports whose device the engine
    /// already lost count as gone even when the path is listed again.
    pub fn refresh(&self) -> Result<(), PortError> {
        let devices: Vec<DeviceInfo> = self
            .inner
            .enumerator
            .devices()?
            .into_iter()
            .filter(|d| !self.inner.config.is_excluded(&d.path))
            .collect();
        let present: HashSet<&str> = devices.iter().map(|d| d.path.as_str()).collect();

        let gone: Vec<String> = self
            .inner
            .ports
            .lock()
            .iter()
            .filter(|(path, port)| !present.contains(path.as_str()) || !is_live(port))
            .map(|(path, _)| path.clone())
            .collect();

        debug!(devices = devices.len(), gone = gone.len(), "Rescanned serial devices");
        self.handle_removals(&gone);
        self.handle_arrivals(&devices);
        Ok(())
    }

    /// Close every open port, remembering which ones to reopen on wake.
    pub fn system_will_sleep(&self) {
        let mut closed = Vec::new();
        for port in self.ports() {
            if port.is_open() {
                match port.close() {
                    Ok(()) => closed.push(port.path().to_string()),
                    Err(e) => warn!(path = %port.path(), error = %e, "Failed to close port for sleep"),
                }
            }
        }
        info!(count = closed.len(), "Closed serial ports for system sleep");
        *self.inner.sleeping.lock() = closed;
    }

    /// Reopen exactly the ports closed by [`PortRegistry::system_will_sleep`].
    pub fn system_did_wake(&self) {
        let paths = std::mem::take(&mut *self.inner.sleeping.lock());
        for path in paths {
            let Some(port) = self.port(&path) else {
                continue;
            };
            if let Err(e) = port.open() {
                warn!(path = %path, error = %e, "Failed to reopen port after wake");
            }
        }
    }

    /// Close every open port, e.g. at process exit.
    pub fn close_all(&self) {
        for port in self.ports() {
            if let Err(e) = port.close() {
                warn!(path = %port.path(), error = %e, "Failed to close port");
            }
        }
    }

    /// Rescan every `interval` on a background thread until the returned
    /// watcher is dropped.
    pub fn spawn_watcher(&self, interval: Duration) -> std::io::Result<RegistryWatcher> {
        let registry = self.clone();
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("serial-link-watcher".into())
            .spawn(move || loop {
                if let Err(e) = registry.refresh() {
                    warn!(error = %e, "Serial device scan failed");
                }
                match stopped.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })?;
        Ok(RegistryWatcher {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("enumerator", &self.inner.enumerator)
            .field("ports", &self.inner.ports.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Background rescan thread. Stops when dropped.
#[derive(Debug)]
pub struct RegistryWatcher {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Registry watcher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockEnumerator, MockOpener};

    fn registry(enumerator: &MockEnumerator, config: &Config) -> PortRegistry {
        PortRegistry::new(
            enumerator.clone(),
            Arc::new(MockOpener::new()),
            config,
            EventDispatcher::disabled(),
        )
        .unwrap()
    }

    #[test]
    fn test_refresh_tracks_arrivals_and_removals() {
        let enumerator = MockEnumerator::new();
        let registry = registry(&enumerator, &Config::default());
        let events = registry.subscribe();

        enumerator.plug("/dev/ttyA", "Alpha");
        enumerator.plug("/dev/ttyB", "Beta");
        registry.refresh().unwrap();
        assert_eq!(registry.ports().len(), 2);
        assert_eq!(registry.port("/dev/ttyA").unwrap().name(), "Alpha");
        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::PortsConnected(ports)) if ports.len() == 2
        ));

        // A second scan with no changes publishes nothing.
        registry.refresh().unwrap();
        assert!(events.try_recv().is_err());

        enumerator.unplug("/dev/ttyA");
        registry.refresh().unwrap();
        assert!(registry.port("/dev/ttyA").is_none());
        match events.try_recv() {
            Ok(RegistryEvent::PortsDisconnected(ports)) => {
                assert_eq!(ports.len(), 1);
                assert_eq!(ports[0].path(), "/dev/ttyA");
                assert_eq!(ports[0].state(), crate::engine::PortState::Removed);
            }
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[test]
    fn test_get_or_insert_deduplicates() {
        let enumerator = MockEnumerator::new();
        let registry = registry(&enumerator, &Config::default());

        let a = registry.get_or_insert("/dev/ttyX").unwrap();
        let b = registry.get_or_insert("/dev/ttyX").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "ttyX");

        assert!(registry
            .handle_arrivals(&[DeviceInfo::new("/dev/ttyX", "X")])
            .is_empty());
    }

    #[test]
    fn test_exclusions_and_aliases() {
        let mut config = Config::default();
        config.registry.exclude_ports = vec!["/dev/ttyS0".into()];
        config
            .registry
            .port_aliases
            .insert("/dev/ttyUSB0".into(), "GPS".into());

        let enumerator = MockEnumerator::new();
        enumerator.plug("/dev/ttyS0", "ttyS0");
        enumerator.plug("/dev/ttyUSB0", "FT232R");
        let registry = registry(&enumerator, &config);
        registry.refresh().unwrap();

        assert!(registry.port("/dev/ttyS0").is_none());
        assert_eq!(registry.port("/dev/ttyUSB0").unwrap().name(), "GPS");
    }
}
