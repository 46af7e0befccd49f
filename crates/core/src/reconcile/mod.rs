//! Desired-state documents and the reconciler that diffs them against the
//! live device set.
//!
//! ```json
//! { "facade": { "apiVersion": "v1", "devices": [
//!     { "video": { "id": "…", "name": "Facade", "width": "1920", "height": "1080", "frameRate": "60" } }
//! ] } }
//! ```
//!
//! Top-level problems (wrong root, version, missing or repeated keys, too many
//! entries) reject the whole document. Problems inside one entry only skip
//! that entry.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{DeviceId, DeviceSnapshot, FacadeError, FormatBounds, Result, VideoFormat, MAX_DEVICES};

pub const API_VERSION: &str = "v1";

/// Parsed and top-level-validated desired-state document.
#[derive(Debug)]
pub struct DesiredDocument {
    entries: Vec<Box<RawValue>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RootDocument {
    facade: RootDeviceSet,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RootDeviceSet {
    api_version: String,
    devices: Vec<Box<RawValue>>,
}

impl DesiredDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        let root: RootDocument = serde_json::from_str(text).map_err(|err| {
            if err.is_data() {
                FacadeError::schema(err.to_string())
            } else {
                FacadeError::Document(err)
            }
        })?;

        let set = root.facade;
        if set.api_version != API_VERSION {
            return Err(FacadeError::schema(format!(
                "unsupported apiVersion `{}`, expected `{API_VERSION}`",
                set.api_version
            )));
        }
        if set.devices.len() > MAX_DEVICES {
            return Err(FacadeError::schema(format!(
                "{} devices listed, at most {MAX_DEVICES} are supported",
                set.devices.len()
            )));
        }

        Ok(Self {
            entries: set.devices,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Works out the operations that bring `current` in line with this
    /// document. Pure: nothing is applied.
    pub fn plan(&self, current: &[DeviceSnapshot]) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();
        let mut referenced = HashSet::new();

        for (index, raw) in self.entries.iter().enumerate() {
            if let Err(reason) = plan_entry(raw, current, &mut referenced, &mut plan) {
                tracing::warn!(entry = index, %reason, "skipping desired-state entry");
                plan.warnings.push(EntryWarning { index, reason });
            }
        }

        plan.deletes = current
            .iter()
            .filter(|device| !referenced.contains(&device.id))
            .map(|device| DeleteOp { id: device.id })
            .collect();

        plan
    }

    /// Devices as saved by [`export_document`], identifiers included, for
    /// rebuilding a device set from scratch. Every entry must carry a valid
    /// id, a name and a format; the ones that do not are reported instead.
    pub fn saved_devices(&self) -> (Vec<DeviceSnapshot>, Vec<EntryWarning>) {
        let mut devices = Vec::new();
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();

        for (index, raw) in self.entries.iter().enumerate() {
            match saved_entry(raw, &mut seen) {
                Ok(device) => devices.push(device),
                Err(reason) => warnings.push(EntryWarning { index, reason }),
            }
        }
        (devices, warnings)
    }
}

/// Parses `document` and plans it against `current` in one step.
pub fn plan(current: &[DeviceSnapshot], document: &str) -> Result<ReconcilePlan> {
    Ok(DesiredDocument::from_json(document)?.plan(current))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOp {
    pub id: DeviceId,
    pub format: VideoFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOp {
    pub name: String,
    pub format: VideoFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOp {
    pub id: DeviceId,
}

/// Operations to apply, in the order updates, creates, deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub updates: Vec<UpdateOp>,
    pub creates: Vec<CreateOp>,
    pub deletes: Vec<DeleteOp>,
    pub warnings: Vec<EntryWarning>,
}

impl ReconcilePlan {
    /// `true` when applying the plan would not change anything.
    pub fn is_noop(&self) -> bool {
        self.updates.is_empty() && self.creates.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWarning {
    pub index: usize,
    pub reason: SkipReason,
}

/// Why an entry was left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Malformed(String),
    MissingField(&'static str),
    InvalidNumber { field: &'static str, value: String },
    OutOfRange { field: &'static str, value: u32 },
    EmptyName,
    UnknownIdentifier(String),
    DuplicateIdentifier(DeviceId),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Malformed(reason) => write!(f, "malformed entry: {reason}"),
            SkipReason::MissingField(field) => write!(f, "missing required field `{field}`"),
            SkipReason::InvalidNumber { field, value } => {
                write!(f, "`{field}` is not an integer: `{value}`")
            }
            SkipReason::OutOfRange { field, value } => write!(f, "`{field}` {value} is out of range"),
            SkipReason::EmptyName => f.write_str("`name` is empty"),
            SkipReason::UnknownIdentifier(id) => write!(f, "no device with id `{id}`"),
            SkipReason::DuplicateIdentifier(id) => write!(f, "device {id} is listed twice"),
        }
    }
}

/// One entry of the `devices` list, keyed by device kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum DeviceEntry {
    Video(VideoEntry),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct VideoEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    width: Option<Leaf>,
    #[serde(default)]
    height: Option<Leaf>,
    #[serde(default)]
    frame_rate: Option<Leaf>,
}

/// Numeric leaf; written as a decimal string, numbers accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Leaf {
    Text(String),
    Number(u64),
}

impl Leaf {
    fn parse(&self, field: &'static str) -> std::result::Result<u32, SkipReason> {
        let invalid = |value: String| SkipReason::InvalidNumber { field, value };
        match self {
            Leaf::Text(text) => text.trim().parse().map_err(|_| invalid(text.clone())),
            Leaf::Number(number) => u32::try_from(*number).map_err(|_| invalid(number.to_string())),
        }
    }
}

fn plan_entry(
    raw: &RawValue,
    current: &[DeviceSnapshot],
    referenced: &mut HashSet<DeviceId>,
    plan: &mut ReconcilePlan,
) -> std::result::Result<(), SkipReason> {
    let DeviceEntry::Video(entry) = serde_json::from_str(raw.get())
        .map_err(|err| SkipReason::Malformed(err.to_string()))?;

    // Resolve the identifier first: an entry naming a live device keeps that
    // device alive even when its other fields are rejected below.
    let existing = match &entry.id {
        Some(text) => {
            let device = text
                .parse::<DeviceId>()
                .ok()
                .and_then(|id| current.iter().find(|device| device.id == id))
                .ok_or_else(|| SkipReason::UnknownIdentifier(text.clone()))?;
            if !referenced.insert(device.id) {
                return Err(SkipReason::DuplicateIdentifier(device.id));
            }
            Some(device)
        }
        None => None,
    };

    let name = entry.name.ok_or(SkipReason::MissingField("name"))?;
    let format = entry_format(entry.width, entry.height, entry.frame_rate)?;

    match existing {
        Some(device) => {
            if device.format != format {
                plan.updates.push(UpdateOp {
                    id: device.id,
                    format,
                });
            }
        }
        None => {
            let name = name.trim();
            if name.is_empty() {
                return Err(SkipReason::EmptyName);
            }
            plan.creates.push(CreateOp {
                name: name.to_string(),
                format,
            });
        }
    }
    Ok(())
}

fn saved_entry(
    raw: &RawValue,
    seen: &mut HashSet<DeviceId>,
) -> std::result::Result<DeviceSnapshot, SkipReason> {
    let DeviceEntry::Video(entry) = serde_json::from_str(raw.get())
        .map_err(|err| SkipReason::Malformed(err.to_string()))?;

    let text = entry.id.ok_or(SkipReason::MissingField("id"))?;
    let id = text
        .parse::<DeviceId>()
        .map_err(|_| SkipReason::UnknownIdentifier(text.clone()))?;
    if !seen.insert(id) {
        return Err(SkipReason::DuplicateIdentifier(id));
    }

    let name = entry.name.ok_or(SkipReason::MissingField("name"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(SkipReason::EmptyName);
    }
    let format = entry_format(entry.width, entry.height, entry.frame_rate)?;

    Ok(DeviceSnapshot {
        id,
        name: name.to_string(),
        format,
    })
}

fn entry_format(
    width: Option<Leaf>,
    height: Option<Leaf>,
    frame_rate: Option<Leaf>,
) -> std::result::Result<VideoFormat, SkipReason> {
    let bounds = FormatBounds::CANONICAL;

    let width = width.ok_or(SkipReason::MissingField("width"))?.parse("width")?;
    let height = height.ok_or(SkipReason::MissingField("height"))?.parse("height")?;
    let frame_rate = frame_rate
        .ok_or(SkipReason::MissingField("frameRate"))?
        .parse("frameRate")?;

    if !bounds.dimension_in_range(width) {
        return Err(SkipReason::OutOfRange { field: "width", value: width });
    }
    if !bounds.dimension_in_range(height) {
        return Err(SkipReason::OutOfRange { field: "height", value: height });
    }
    if !bounds.frame_rate_in_range(frame_rate) {
        return Err(SkipReason::OutOfRange { field: "frameRate", value: frame_rate });
    }

    Ok(VideoFormat::new(width, height, frame_rate))
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    facade: ExportDeviceSet<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportDeviceSet<'a> {
    api_version: &'a str,
    devices: Vec<DeviceEntry>,
}

/// Serialises `devices` into a desired-state document that imports back as
/// a no-op.
pub fn export_document(devices: &[DeviceSnapshot]) -> Result<String> {
    let devices = devices
        .iter()
        .map(|device| {
            DeviceEntry::Video(VideoEntry {
                id: Some(device.id.to_string()),
                name: Some(device.name.clone()),
                width: Some(Leaf::Text(device.format.width.to_string())),
                height: Some(Leaf::Text(device.format.height.to_string())),
                frame_rate: Some(Leaf::Text(device.format.frame_rate.to_string())),
            })
        })
        .collect();

    let document = ExportDocument {
        facade: ExportDeviceSet {
            api_version: API_VERSION,
            devices,
        },
    };
    Ok(serde_json::to_string_pretty(&document)?)
}
