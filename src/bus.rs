//! Property bus abstraction.
//!
//! The control process exchanges state with remote clients through named
//! property vectors (`exptime`, `temp_ccd`, `expose`, ...), each holding
//! one or more fields. Clients send writes; the process publishes updates.
//!
//! [`ChannelBus`] is the in-process implementation. Its counterpart
//! [`BusClient`] plays the remote side: it flips the connection status,
//! injects writes and receives definitions and updates.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Connectivity of the bus as seen by the control process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// Whether bus clients may write a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyPerm {
    ReadOnly,
    ReadWrite,
}

/// Momentary or toggle switch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

/// Value carried by one property field.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// `None` publishes an empty number (e.g. temperature after a failed read).
    Number(Option<f64>),
    Switch(SwitchState),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Number(Some(v)) => write!(f, "{v}"),
            PropertyValue::Number(None) => f.write_str("-"),
            PropertyValue::Switch(SwitchState::On) => f.write_str("On"),
            PropertyValue::Switch(SwitchState::Off) => f.write_str("Off"),
            PropertyValue::Text(s) => f.write_str(s),
        }
    }
}

/// One named field inside a property vector.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyElement {
    pub name: String,
    pub value: PropertyValue,
}

impl PropertyElement {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Property definition announced to the bus once connected.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyVector {
    pub device: String,
    pub name: String,
    pub perm: PropertyPerm,
    pub elements: Vec<PropertyElement>,
}

/// Inbound write from a bus client.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyWrite {
    pub property: String,
    pub field: String,
    pub value: PropertyValue,
}

impl PropertyWrite {
    pub fn new(property: impl Into<String>, field: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            property: property.into(),
            field: field.into(),
            value,
        }
    }
}

/// Parses console commands of the form `property.field=value`.
///
/// `On`/`Off` (any case) become switch values, anything parsing as a float
/// becomes a number, everything else is text.
impl FromStr for PropertyWrite {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let (path, raw) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("expected property.field=value, got '{}'", line))?;
        let (property, field) = path
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow!("expected property.field, got '{}'", path.trim()))?;
        if property.is_empty() || field.is_empty() {
            bail!("empty property or field name in '{}'", line);
        }

        let raw = raw.trim();
        let value = if raw.eq_ignore_ascii_case("on") {
            PropertyValue::Switch(SwitchState::On)
        } else if raw.eq_ignore_ascii_case("off") {
            PropertyValue::Switch(SwitchState::Off)
        } else if let Ok(number) = raw.parse::<f64>() {
            PropertyValue::Number(Some(number))
        } else {
            PropertyValue::Text(raw.to_string())
        };

        Ok(PropertyWrite::new(property, field, value))
    }
}

/// Outbound field publication.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub property: String,
    pub field: String,
    pub value: PropertyValue,
}

impl PropertyUpdate {
    pub fn new(property: impl Into<String>, field: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            property: property.into(),
            field: field.into(),
            value,
        }
    }
}

/// Bus as consumed by the control loop.
#[async_trait]
pub trait PropertyBus: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    /// Announce a property vector and its initial values.
    async fn define(&self, vector: PropertyVector) -> Result<()>;

    /// Take every write received since the last call.
    async fn drain(&self) -> Vec<PropertyWrite>;

    async fn publish(&self, update: PropertyUpdate) -> Result<()>;
}

/// Message seen by the remote side of a [`ChannelBus`].
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Define(PropertyVector),
    Update(PropertyUpdate),
}

/// In-process bus backed by tokio channels.
pub struct ChannelBus {
    status: watch::Receiver<ConnectionStatus>,
    writes: Mutex<mpsc::UnboundedReceiver<PropertyWrite>>,
    messages: mpsc::UnboundedSender<BusMessage>,
}

/// Remote end of a [`ChannelBus`].
pub struct BusClient {
    status: watch::Sender<ConnectionStatus>,
    writes: mpsc::UnboundedSender<PropertyWrite>,
    messages: mpsc::UnboundedReceiver<BusMessage>,
}

/// Cloneable write handle split off a [`BusClient`].
#[derive(Clone)]
pub struct BusWriter {
    writes: mpsc::UnboundedSender<PropertyWrite>,
}

impl ChannelBus {
    /// Create a disconnected bus and its client.
    pub fn new() -> (ChannelBus, BusClient) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let bus = ChannelBus {
            status: status_rx,
            writes: Mutex::new(writes_rx),
            messages: messages_tx,
        };
        let client = BusClient {
            status: status_tx,
            writes: writes_tx,
            messages: messages_rx,
        };
        (bus, client)
    }
}

#[async_trait]
impl PropertyBus for ChannelBus {
    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    async fn define(&self, vector: PropertyVector) -> Result<()> {
        self.messages
            .send(BusMessage::Define(vector))
            .map_err(|_| anyhow!("bus client disconnected"))
    }

    async fn drain(&self) -> Vec<PropertyWrite> {
        let mut writes = self.writes.lock().await;
        let mut drained = Vec::new();
        while let Ok(write) = writes.try_recv() {
            drained.push(write);
        }
        drained
    }

    async fn publish(&self, update: PropertyUpdate) -> Result<()> {
        self.messages
            .send(BusMessage::Update(update))
            .map_err(|_| anyhow!("bus client disconnected"))
    }
}

impl BusClient {
    pub fn set_status(&self, status: ConnectionStatus) {
        // send_replace never fails, even with no receiver left
        self.status.send_replace(status);
    }

    pub fn write(&self, write: PropertyWrite) -> Result<()> {
        self.writes
            .send(write)
            .map_err(|_| anyhow!("control process no longer reading the bus"))
    }

    pub fn writer(&self) -> BusWriter {
        BusWriter {
            writes: self.writes.clone(),
        }
    }

    /// Wait for the next definition or update.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.messages.recv().await
    }

    /// Everything published so far, without waiting.
    pub fn take_messages(&mut self) -> Vec<BusMessage> {
        let mut taken = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            taken.push(message);
        }
        taken
    }

    /// Updates published so far, definitions skipped.
    pub fn take_updates(&mut self) -> Vec<PropertyUpdate> {
        self.take_messages()
            .into_iter()
            .filter_map(|message| match message {
                BusMessage::Update(update) => Some(update),
                BusMessage::Define(_) => None,
            })
            .collect()
    }
}

impl BusWriter {
    pub fn write(&self, write: PropertyWrite) -> Result<()> {
        self.writes
            .send(write)
            .map_err(|_| anyhow!("control process no longer reading the bus"))
    }
}

/// Block until the bus reports a connection, polling every `poll`.
pub async fn wait_for_connection(bus: &dyn PropertyBus, poll: Duration) {
    while bus.status() != ConnectionStatus::Connected {
        tracing::info!("Waiting for connection before trying to define properties...");
        tokio::time::sleep(poll).await;
    }
    tracing::info!("Property bus connected");
}
