//! Typed camera property registry.
//!
//! Every node the scan touches is declared here once, with its value kind
//! fixed at compile time: [`Property<T>`] for boolean, integer and float
//! nodes, [`Selector`] for enumeration nodes and [`Command`] for command
//! nodes. [`PropertyRegistry::validate`] checks the declared set against the
//! device's node map when the session opens; after that, access goes through
//! [`BoundNodes`], which never looks up an unvalidated name.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{NodeMap, NodeRange, NodeValue};

/// Rust type that maps onto one [`NodeValue`] variant.
pub trait NodeKind: Copy + Send + Sync + fmt::Debug + 'static {
    /// Human-readable kind name used in errors.
    const KIND: &'static str;

    /// Wrap the value.
    fn into_value(self) -> NodeValue;

    /// Unwrap a value of the matching variant.
    fn from_value(value: NodeValue) -> Option<Self>;
}

impl NodeKind for bool {
    const KIND: &'static str = "boolean";

    fn into_value(self) -> NodeValue {
        NodeValue::Bool(self)
    }

    fn from_value(value: NodeValue) -> Option<Self> {
        match value {
            NodeValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl NodeKind for i64 {
    const KIND: &'static str = "integer";

    fn into_value(self) -> NodeValue {
        NodeValue::Int(self)
    }

    fn from_value(value: NodeValue) -> Option<Self> {
        match value {
            NodeValue::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl NodeKind for f64 {
    const KIND: &'static str = "float";

    fn into_value(self) -> NodeValue {
        NodeValue::Float(self)
    }

    fn from_value(value: NodeValue) -> Option<Self> {
        match value {
            NodeValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

/// A value node of kind `T`.
pub struct Property<T> {
    name: &'static str,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Property<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _kind: PhantomData,
        }
    }

    /// Node name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Property<T> {}

impl<T: NodeKind> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Property<{}>({})", T::KIND, self.name)
    }
}

/// An enumeration node, written by entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector(&'static str);

impl Selector {
    /// Node name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

/// A command node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command(&'static str);

impl Command {
    /// Node name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

/// Horizontal mirroring.
pub const REVERSE_X: Property<bool> = Property::new("ReverseX");
/// Vertical mirroring.
pub const REVERSE_Y: Property<bool> = Property::new("ReverseY");
/// Horizontal binning factor.
pub const BINNING_HORIZONTAL: Property<i64> = Property::new("BinningHorizontal");
/// Vertical binning factor.
pub const BINNING_VERTICAL: Property<i64> = Property::new("BinningVertical");
/// Image width in pixels.
pub const WIDTH: Property<i64> = Property::new("Width");
/// Image height in pixels.
pub const HEIGHT: Property<i64> = Property::new("Height");
/// Sensor pixel format.
pub const PIXEL_FORMAT: Selector = Selector("PixelFormat");
/// Exposure time in microseconds.
pub const EXPOSURE_TIME: Property<f64> = Property::new("ExposureTime");
/// Channel addressed by `GAIN`.
pub const GAIN_SELECTOR: Selector = Selector("GainSelector");
/// Gain of the selected channel.
pub const GAIN: Property<f64> = Property::new("Gain");
/// ADC gain correction switch.
pub const ADC_GAIN_CORRECTION: Property<bool> = Property::new("ADCGainCorrection");
/// Frame rate in Hz.
pub const ACQUISITION_FRAME_RATE: Property<f64> = Property::new("AcquisitionFrameRate");
/// Trigger addressed by the other trigger nodes.
pub const TRIGGER_SELECTOR: Selector = Selector("TriggerSelector");
/// Trigger source.
pub const TRIGGER_SOURCE: Selector = Selector("TriggerSource");
/// Trigger on or off.
pub const TRIGGER_MODE: Selector = Selector("TriggerMode");
/// Bytes per frame buffer.
pub const PAYLOAD_SIZE: Property<i64> = Property::new("PayloadSize");
/// Transport-layer parameter lock; non-zero while streaming.
pub const TL_PARAMS_LOCKED: Property<i64> = Property::new("TLParamsLocked");
/// Start acquisition on the device.
pub const ACQUISITION_START: Command = Command("AcquisitionStart");
/// Stop acquisition on the device.
pub const ACQUISITION_STOP: Command = Command("AcquisitionStop");
/// Fire a software trigger.
pub const TRIGGER_SOFTWARE: Command = Command("TriggerSoftware");

/// Gain selector entry that addresses the analog gain of all channels.
pub const GAIN_ANALOG_ALL: &str = "AnalogAll";

/// Nodes without which a software-triggered capture cannot run.
const REQUIRED: [&str; 4] = [
    PAYLOAD_SIZE.name(),
    TL_PARAMS_LOCKED.name(),
    ACQUISITION_START.name(),
    TRIGGER_SOFTWARE.name(),
];

/// Nodes used when present; a missing one surfaces as a configuration warning.
const OPTIONAL: [&str; 16] = [
    REVERSE_X.name(),
    REVERSE_Y.name(),
    BINNING_HORIZONTAL.name(),
    BINNING_VERTICAL.name(),
    WIDTH.name(),
    HEIGHT.name(),
    PIXEL_FORMAT.name(),
    EXPOSURE_TIME.name(),
    GAIN_SELECTOR.name(),
    GAIN.name(),
    ADC_GAIN_CORRECTION.name(),
    ACQUISITION_FRAME_RATE.name(),
    TRIGGER_SELECTOR.name(),
    TRIGGER_SOURCE.name(),
    TRIGGER_MODE.name(),
    ACQUISITION_STOP.name(),
];

/// The subset of declared nodes a device actually exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRegistry {
    available: BTreeSet<&'static str>,
}

impl PropertyRegistry {
    /// Check the declared node set against `map`.
    ///
    /// # Errors
    /// `Connection` listing every required node the device lacks.
    pub fn validate(map: &dyn NodeMap) -> ScanResult<Self> {
        let missing: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|name| !map.has_node(name))
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "Camera lacks required nodes");
            return Err(ScanError::Connection(format!(
                "camera lacks required nodes: {}",
                missing.join(", ")
            )));
        }

        let mut available: BTreeSet<&'static str> = REQUIRED.iter().copied().collect();
        for name in OPTIONAL {
            if map.has_node(name) {
                available.insert(name);
            } else {
                debug!(node = name, "Optional camera node not available");
            }
        }
        Ok(Self { available })
    }

    /// Whether the device exposes `name`.
    pub fn supports(&self, name: &str) -> bool {
        self.available.contains(name)
    }

    fn check(&self, name: &'static str) -> Result<()> {
        if self.supports(name) {
            Ok(())
        } else {
            bail!("node '{}' is not available on this device", name)
        }
    }
}

/// Validated, typed view of a device node map.
#[derive(Clone, Copy)]
pub struct BoundNodes<'a> {
    map: &'a dyn NodeMap,
    registry: &'a PropertyRegistry,
}

impl<'a> BoundNodes<'a> {
    /// Pair a node map with the registry validated against it.
    pub fn new(map: &'a dyn NodeMap, registry: &'a PropertyRegistry) -> Self {
        Self { map, registry }
    }

    /// Read a value node.
    pub async fn get<T: NodeKind>(&self, property: Property<T>) -> Result<T> {
        self.registry.check(property.name)?;
        let value = self.map.value(property.name).await?;
        T::from_value(value.clone()).ok_or_else(|| {
            anyhow!(
                "node '{}' holds {:?}, expected {}",
                property.name,
                value,
                T::KIND
            )
        })
    }

    /// Write a value node.
    pub async fn set<T: NodeKind>(&self, property: Property<T>, value: T) -> Result<()> {
        self.registry.check(property.name)?;
        self.map.set_value(property.name, value.into_value()).await
    }

    /// Limits of a numeric node.
    pub async fn range<T: NodeKind>(&self, property: Property<T>) -> Result<NodeRange> {
        self.registry.check(property.name)?;
        self.map.range(property.name).await
    }

    /// Current entry of an enumeration node.
    pub async fn entry(&self, selector: Selector) -> Result<String> {
        self.registry.check(selector.0)?;
        match self.map.value(selector.0).await? {
            NodeValue::Enum(entry) => Ok(entry),
            other => bail!("node '{}' holds {:?}, expected an entry", selector.0, other),
        }
    }

    /// Select an enumeration entry.
    pub async fn select(&self, selector: Selector, entry: &str) -> Result<()> {
        self.registry.check(selector.0)?;
        self.map.set_current_entry(selector.0, entry).await
    }

    /// Execute a command without waiting for completion.
    pub async fn execute(&self, command: Command) -> Result<()> {
        self.registry.check(command.0)?;
        self.map.execute(command.0).await
    }

    /// Execute a command and block until the device reports it done.
    pub async fn execute_and_wait(&self, command: Command) -> Result<()> {
        self.execute(command).await?;
        self.map.wait_until_done(command.0).await
    }
}
