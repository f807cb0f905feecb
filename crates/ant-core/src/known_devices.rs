//! Pairing credentials for ANT-FS devices this host has paired with.
//!
//! Persisted as TOML, one table per device keyed by its pairing identifier
//! as eight hex digits:
//!
//! ```toml
//! [3ade68b1]
//! key = "0102030405060708"
//! device_number = "1234"
//! ```

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_number: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownDevice {
    pub key: Option<Vec<u8>>,
    /// ANT device number last seen carrying this device.
    pub device_number: Option<u16>,
}

/// In-memory view of the store; parsing and rendering do no I/O.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownDevices {
    devices: BTreeMap<u32, KnownDevice>,
}

impl KnownDevices {
    /// # Errors
    /// Fails on invalid TOML or malformed hex values.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let records: BTreeMap<String, Record> = toml::from_str(text)?;
        let mut devices = BTreeMap::new();
        for (section, record) in records {
            let id = u32::from_str_radix(&section, 16)
                .with_context(|| format!("invalid device id `{section}`"))?;
            let key = record
                .key
                .as_deref()
                .map(hex::decode)
                .transpose()
                .with_context(|| format!("invalid key for {section}"))?;
            let device_number = record
                .device_number
                .as_deref()
                .map(|n| u16::from_str_radix(n, 16))
                .transpose()
                .with_context(|| format!("invalid device number for {section}"))?;
            devices.insert(id, KnownDevice { key, device_number });
        }
        Ok(Self { devices })
    }

    /// # Errors
    /// Fails if the records cannot be serialised.
    pub fn render(&self) -> anyhow::Result<String> {
        let records: BTreeMap<String, Record> = self
            .devices
            .iter()
            .map(|(id, device)| {
                (
                    format!("{id:08x}"),
                    Record {
                        key: device.key.as_deref().map(hex::encode),
                        device_number: device.device_number.map(|n| format!("{n:04x}")),
                    },
                )
            })
            .collect();
        Ok(toml::to_string(&records)?)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&KnownDevice> {
        self.devices.get(&id)
    }

    #[must_use]
    pub fn key(&self, id: u32) -> Option<&[u8]> {
        self.devices.get(&id)?.key.as_deref()
    }

    pub fn set_key(&mut self, id: u32, key: &[u8]) {
        self.devices.entry(id).or_default().key = Some(key.to_vec());
    }

    #[must_use]
    pub fn device_id(&self, device_number: u16) -> Option<u32> {
        self.devices
            .iter()
            .find_map(|(id, d)| (d.device_number == Some(device_number)).then_some(*id))
    }

    /// Device numbers are reused over the air, so a number moves to `id`
    /// from whichever device held it before.
    pub fn set_device_number(&mut self, device_number: u16, id: u32) {
        for device in self.devices.values_mut() {
            if device.device_number == Some(device_number) {
                device.device_number = None;
            }
        }
        self.devices.entry(id).or_default().device_number = Some(device_number);
    }

    pub fn remove(&mut self, id: u32) -> Option<KnownDevice> {
        self.devices.remove(&id)
    }
}

/// The known device store, optionally backed by a file that is rewritten on
/// every change.
#[derive(Clone, Debug, Default)]
pub struct KnownDeviceDb {
    devices: KnownDevices,
    path: Option<PathBuf>,
}

impl KnownDeviceDb {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the store at `path`; a missing file is an empty store.
    ///
    /// # Errors
    /// Fails if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let devices = match fs::read_to_string(&path) {
            Ok(text) => KnownDevices::parse(&text)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => KnownDevices::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        debug!("loaded known devices from {}", path.display());
        Ok(Self {
            devices,
            path: Some(path),
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn devices(&self) -> &KnownDevices {
        &self.devices
    }

    #[must_use]
    pub fn get_key(&self, id: u32) -> Option<&[u8]> {
        self.devices.key(id)
    }

    /// # Errors
    /// Fails if the store cannot be written.
    pub fn add_key(&mut self, id: u32, key: &[u8]) -> anyhow::Result<()> {
        self.devices.set_key(id, key);
        self.save()
    }

    #[must_use]
    pub fn get_device_id(&self, device_number: u16) -> Option<u32> {
        self.devices.device_id(device_number)
    }

    /// # Errors
    /// Fails if the store cannot be written.
    pub fn add_device_id(&mut self, device_number: u16, id: u32) -> anyhow::Result<()> {
        self.devices.set_device_number(device_number, id);
        self.save()
    }

    /// # Errors
    /// Fails if the store cannot be written.
    pub fn delete_device(&mut self, id: u32) -> anyhow::Result<()> {
        self.devices.remove(id);
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        fs::write(path, self.devices.render()?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_devices.toml");

        let mut db = KnownDeviceDb::open(&path).unwrap();
        db.add_key(0x3ADE_68B1, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        db.add_device_id(0x1234, 0x3ADE_68B1).unwrap();

        let db = KnownDeviceDb::open(&path).unwrap();
        assert_eq!(db.get_key(0x3ADE_68B1), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
        assert_eq!(db.get_device_id(0x1234), Some(0x3ADE_68B1));
    }

    #[test]
    fn delete_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_devices.toml");

        let mut db = KnownDeviceDb::open(&path).unwrap();
        db.add_key(7, b"secret").unwrap();
        db.delete_device(7).unwrap();

        let db = KnownDeviceDb::open(&path).unwrap();
        assert_eq!(db.get_key(7), None);
    }

    #[test]
    fn tolerates_missing_fields() {
        let devices = KnownDevices::parse(
            r#"
            [0000000a]
            device_number = "00ff"

            [0000000b]
            key = "abcd"
            "#,
        )
        .unwrap();
        assert_eq!(devices.key(0x0A), None);
        assert_eq!(devices.device_id(0xFF), Some(0x0A));
        assert_eq!(devices.key(0x0B), Some(&[0xAB, 0xCD][..]));
        assert_eq!(devices.get(0x0B).and_then(|d| d.device_number), None);
    }

    #[test]
    fn device_number_moves_between_devices() {
        let mut devices = KnownDevices::default();
        devices.set_device_number(5, 1);
        devices.set_device_number(5, 2);
        assert_eq!(devices.device_id(5), Some(2));
        assert_eq!(devices.get(1).and_then(|d| d.device_number), None);
    }

    #[test]
    fn render_is_parseable() {
        let mut devices = KnownDevices::default();
        devices.set_key(0x0102_0304, &[0xFF, 0x00]);
        devices.set_device_number(0x4242, 0x0102_0304);
        let text = devices.render().unwrap();
        assert!(text.contains("01020304"));
        assert!(text.contains("key = \"ff00\""));
        assert_eq!(KnownDevices::parse(&text).unwrap(), devices);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(KnownDevices::parse("[zz]\nkey = \"00\"").is_err());
        assert!(KnownDevices::parse("[00000001]\nkey = \"abc\"").is_err());
        assert!(KnownDevices::parse("[00000001]\nkey = \"0g\"").is_err());
    }

    #[test]
    fn keys_in_either_case() {
        let devices = KnownDevices::parse("[00000001]\nkey = \"A0b1\"").unwrap();
        assert_eq!(devices.key(1), Some(&[0xA0, 0xB1][..]));
    }
}
