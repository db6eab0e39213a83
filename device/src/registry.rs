use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use snafu::{OptionExt, ensure};
use tracing::{debug, info};

use crate::device::{Device, FamilyCaps};
use crate::error::{InvalidDeviceSnafu, NoUsableDeviceSnafu, Result, UnknownFamilySnafu, WrongContextSnafu};

/// A parsed device string: `FAMILY` or `FAMILY:index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub family: String,
    pub index: usize,
}

impl DeviceId {
    pub fn new(family: impl Into<String>, index: usize) -> Self {
        Self { family: family.into().to_uppercase(), index }
    }

    /// Parse a device string.
    ///
    /// Examples:
    /// - "cpu" -> CPU, index 0
    /// - "EMU:1" -> EMU, index 1
    pub fn parse(s: &str) -> Result<Self> {
        let (family, index) = match s.trim().split_once(':') {
            Some((family, index)) => {
                let index = index.trim().parse().ok().context(InvalidDeviceSnafu { device: s.to_string() })?;
                (family, index)
            }
            None => (s.trim(), 0),
        };
        let family = family.trim();
        ensure!(!family.is_empty(), InvalidDeviceSnafu { device: s.to_string() });
        Ok(Self::new(family, index))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            0 => write!(f, "{}", self.family),
            i => write!(f, "{}:{i}", self.family),
        }
    }
}

/// Canonical form of a device string: upper-case family, no `:0` suffix.
pub fn canonicalize(name: &str) -> Result<String> {
    Ok(DeviceId::parse(name)?.to_string())
}

/// Opens device `id` of a family.
pub type FamilyFactory = Arc<dyn Fn(&DeviceId) -> Result<Device> + Send + Sync>;

struct Family {
    caps: FamilyCaps,
    factory: FamilyFactory,
}

/// Lazily opened devices, keyed by canonical name.
///
/// The registry belongs to the thread that built it. Compute devices can only
/// be opened from that thread; pass-through families can be opened anywhere.
pub struct DeviceRegistry {
    families: HashMap<String, Family>,
    devices: RwLock<HashMap<String, Arc<Device>>>,
    owner: ThreadId,
    priority: Vec<String>,
    preferred: Option<String>,
    default: OnceCell<Arc<Device>>,
}

impl DeviceRegistry {
    pub fn builder() -> DeviceRegistryBuilder {
        DeviceRegistryBuilder::default()
    }

    pub fn family_caps(&self, family: &str) -> Option<FamilyCaps> {
        self.families.get(&family.to_uppercase()).map(|f| f.caps)
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    /// Get or open a device.
    pub fn resolve(&self, name: &str) -> Result<Arc<Device>> {
        let id = DeviceId::parse(name)?;
        let canonical = id.to_string();
        let family = self.families.get(&id.family).context(UnknownFamilySnafu { family: id.family.clone() })?;
        if !family.caps.pass_through {
            ensure!(thread::current().id() == self.owner, WrongContextSnafu { device: canonical.clone() });
        }
        ensure!(id.index == 0 || family.caps.multi_instance, InvalidDeviceSnafu { device: canonical.clone() });

        // Fast path: read lock
        {
            let devices = self.devices.read();
            if let Some(device) = devices.get(&canonical) {
                return Ok(Arc::clone(device));
            }
        }

        // Slow path: write lock to create
        let mut devices = self.devices.write();

        // Double-check after acquiring write lock
        if let Some(device) = devices.get(&canonical) {
            return Ok(Arc::clone(device));
        }

        let device = Arc::new((family.factory)(&id)?);
        info!(device = %canonical, compute = device.is_compute(), "opened device");
        devices.insert(canonical, Arc::clone(&device));
        Ok(device)
    }

    /// Already opened devices.
    pub fn opened(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    /// The preferred device if configured, else the first family of the
    /// priority list that opens. Decided once.
    pub fn default_device(&self) -> Result<Arc<Device>> {
        self.default
            .get_or_try_init(|| {
                if let Some(preferred) = &self.preferred {
                    return self.resolve(preferred);
                }
                for name in &self.priority {
                    if !self.families.contains_key(name) {
                        continue;
                    }
                    match self.resolve(name) {
                        Ok(device) => return Ok(device),
                        Err(err) => debug!(device = %name, error = %err, "device unavailable"),
                    }
                }
                NoUsableDeviceSnafu { tried: self.priority.clone() }.fail()
            })
            .cloned()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("families", &self.families.keys().collect::<Vec<_>>())
            .field("opened", &self.devices.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Families are an explicit table; nothing is discovered at runtime.
pub struct DeviceRegistryBuilder {
    families: HashMap<String, Family>,
    priority: Vec<String>,
    preferred: Option<String>,
}

impl Default for DeviceRegistryBuilder {
    fn default() -> Self {
        Self {
            families: HashMap::new(),
            priority: ["CUDA", "METAL", "EMU", "CPU"].into_iter().map(String::from).collect(),
            preferred: None,
        }
    }
}

impl DeviceRegistryBuilder {
    pub fn family(
        mut self,
        name: &str,
        caps: FamilyCaps,
        factory: impl Fn(&DeviceId) -> Result<Device> + Send + Sync + 'static,
    ) -> Self {
        self.families.insert(name.to_uppercase(), Family { caps, factory: Arc::new(factory) });
        self
    }

    /// Families probed by [`DeviceRegistry::default_device`], in order.
    pub fn priority<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.priority = names.into_iter().map(|s| s.into().to_uppercase()).collect();
        self
    }

    pub fn preferred(mut self, device: Option<String>) -> Self {
        self.preferred = device;
        self
    }

    /// The calling thread becomes the owner.
    pub fn build(self) -> DeviceRegistry {
        DeviceRegistry {
            families: self.families,
            devices: RwLock::new(HashMap::new()),
            owner: thread::current().id(),
            priority: self.priority,
            preferred: self.preferred,
            default: OnceCell::new(),
        }
    }
}
