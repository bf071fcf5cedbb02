//! Device-list projection
//!
//! Turns registry snapshots into rows a UI can render directly. Every
//! snapshot is projected in full, so a view is always consistent with
//! exactly one registry state.

use std::fmt;

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::{DeviceListSnapshot, Registry, RegistryError};

pub const EMPTY_LIST: &str = "No devices found.";
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceListView {
    pub owner: String,
    pub rows: Vec<DeviceRow>,
}

impl DeviceListView {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rows sorted by device id. The label is the `name` attribute when the
/// entry carries one, the id otherwise.
pub fn project(snapshot: &DeviceListSnapshot) -> DeviceListView {
    let mut rows: Vec<DeviceRow> = snapshot
        .devices
        .iter()
        .map(|d| {
            let label = match d.name() {
                Some(name) if !name.trim().is_empty() => name.to_string(),
                _ if d.id.is_empty() => UNKNOWN_DEVICE.to_string(),
                _ => d.id.clone(),
            };
            DeviceRow { id: d.id.clone(), label }
        })
        .collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));

    DeviceListView { owner: snapshot.owner.clone(), rows }
}

impl fmt::Display for DeviceListView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            return writeln!(f, "{EMPTY_LIST}");
        }
        for row in &self.rows {
            if row.label == row.id {
                writeln!(f, "  {}", row.id)?;
            } else {
                writeln!(f, "  {:<24} {}", row.label, row.id)?;
            }
        }
        Ok(())
    }
}

/// Subscribe to `owner`'s devices and project every snapshot
pub async fn watch(
    registry: &dyn Registry,
    owner: &str,
) -> Result<BoxStream<'static, Result<DeviceListView, RegistryError>>, RegistryError> {
    let stream = registry.subscribe(owner).await?;
    Ok(stream.map(|s| s.map(|snapshot| project(&snapshot))).boxed())
}
