// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! ESI (EtherCAT Slave Information) XML decoder.
//!
//! Extracts the rx/tx PDO maps and capability flags for one device from a
//! vendor ESI file.  Deliberately tolerant: unknown elements are skipped,
//! namespace prefixes are ignored, and the integer forms found in the wild
//! (`#x1A00`, `0x1A00`, `1A00h`, decimal) are all accepted.

use std::fs;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::cia402;
use crate::master::{PdoConfig, PdoEntryDef};
use crate::status::DriveFeatures;
use crate::{Error, Result};

/// Decoded device description: PDO maps plus derived capability flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsiDevice {
    pub name: String,
    pub product_code: u32,
    pub revision: Option<u32>,
    pub rx_pdos: Vec<PdoConfig>,
    pub tx_pdos: Vec<PdoConfig>,
}

impl EsiDevice {
    /// Capability flags derived from the PDO maps.
    pub fn features(&self) -> DriveFeatures {
        let rx_has = |idx: u16| {
            self.rx_pdos
                .iter()
                .any(|p| p.entries.iter().any(|e| e.index == idx))
        };
        let tx_has = |idx: u16| {
            self.tx_pdos
                .iter()
                .any(|p| p.entries.iter().any(|e| e.index == idx))
        };
        DriveFeatures {
            controlword_in_pdo: rx_has(cia402::CONTROLWORD),
            statusword_in_pdo: tx_has(cia402::STATUSWORD),
            mode_command_in_pdo: rx_has(cia402::MODES_OF_OPERATION),
            mode_display_in_pdo: tx_has(cia402::MODES_OF_OPERATION_DISPLAY),
            touch_probe: rx_has(cia402::PROBE_FUNCTION)
                || tx_has(cia402::PROBE_STATUS)
                || tx_has(cia402::PROBE_POS_POSITIVE),
        }
    }

    /// Which object this device maps for the negative-edge capture, if any.
    pub fn probe_neg_index(&self) -> Option<u16> {
        for idx in [cia402::PROBE_POS_NEGATIVE, cia402::PROBE_POS_NEGATIVE_ALT] {
            if self
                .tx_pdos
                .iter()
                .any(|p| p.entries.iter().any(|e| e.index == idx))
            {
                return Some(idx);
            }
        }
        None
    }
}

/// Parse the integer encodings found in ESI files.
fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("#x").or_else(|| s.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| Error::Esi(format!("invalid number {:?}", s)))
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

fn get_attr(tag: &BytesStart, name: &[u8]) -> Option<String> {
    for attr in tag.attributes().flatten() {
        if local_name(attr.key) == name {
            return Some(String::from_utf8_lossy(&attr.value).into_owned());
        }
    }
    None
}

#[derive(Default)]
struct PdoBuilder {
    index: Option<u16>,
    entries: Vec<PdoEntryDef>,
}

#[derive(Default)]
struct EntryBuilder {
    index: Option<u16>,
    subindex: u8,
    bit_len: u8,
}

#[derive(Default)]
struct DeviceBuilder {
    name: String,
    product_code: Option<u32>,
    revision: Option<u32>,
    rx_pdos: Vec<PdoConfig>,
    tx_pdos: Vec<PdoConfig>,
}

/// Decode all devices in the ESI document.
pub fn decode_devices(xml: &str) -> Result<Vec<EsiDevice>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut devices: Vec<EsiDevice> = Vec::new();
    let mut device: Option<DeviceBuilder> = None;
    // (is_rx, builder) while inside an RxPdo/TxPdo element.
    let mut pdo: Option<(bool, PdoBuilder)> = None;
    let mut entry: Option<EntryBuilder> = None;
    let mut text = String::new();

    loop {
        match reader
            .read_event(&mut buf)
            .map_err(|e| Error::Esi(e.to_string()))?
        {
            Event::Start(ref tag) => {
                let name = local_name(tag.name()).to_vec();
                match name.as_slice() {
                    b"Device" => device = Some(DeviceBuilder::default()),
                    b"RxPdo" if device.is_some() => pdo = Some((true, PdoBuilder::default())),
                    b"TxPdo" if device.is_some() => pdo = Some((false, PdoBuilder::default())),
                    b"Entry" if pdo.is_some() => entry = Some(EntryBuilder::default()),
                    b"Type" => {
                        if let Some(dev) = device.as_mut() {
                            if let Some(pc) = get_attr(tag, b"ProductCode") {
                                dev.product_code = Some(parse_number(&pc)?);
                            }
                            if let Some(rev) = get_attr(tag, b"RevisionNo") {
                                dev.revision = parse_number(&rev).ok();
                            }
                        }
                    }
                    _ => {}
                }
                stack.push(name);
                text.clear();
            }
            Event::Text(ref t) => {
                let raw = t
                    .unescaped()
                    .map_err(|e| Error::Esi(e.to_string()))?
                    .into_owned();
                text = String::from_utf8_lossy(&raw).into_owned();
            }
            Event::End(ref tag) => {
                let name = local_name(tag.name()).to_vec();
                self_close(
                    &name,
                    &mut devices,
                    &mut device,
                    &mut pdo,
                    &mut entry,
                    &stack,
                    &text,
                )?;
                stack.pop();
                text.clear();
            }
            Event::Empty(_) => {}
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(devices)
}

/// Element-close bookkeeping, shared by `End` events.
fn self_close(
    name: &[u8],
    devices: &mut Vec<EsiDevice>,
    device: &mut Option<DeviceBuilder>,
    pdo: &mut Option<(bool, PdoBuilder)>,
    entry: &mut Option<EntryBuilder>,
    stack: &[Vec<u8>],
    text: &str,
) -> Result<()> {
    let parent = stack
        .len()
        .checked_sub(2)
        .and_then(|i| stack.get(i))
        .map(|v| v.as_slice());
    match name {
        b"Index" if entry.is_some() || pdo.is_some() => {
            let value = parse_number(text)? as u16;
            if let Some(e) = entry.as_mut() {
                e.index = Some(value);
            } else if let Some((_, p)) = pdo.as_mut() {
                p.index = Some(value);
            }
        }
        b"SubIndex" => {
            if let Some(e) = entry.as_mut() {
                e.subindex = parse_number(text)? as u8;
            }
        }
        b"BitLen" => {
            if let Some(e) = entry.as_mut() {
                e.bit_len = parse_number(text)? as u8;
            }
        }
        b"Name" => {
            // Only the device's own name; PDO/entry names are noise here.
            if let Some(dev) = device.as_mut() {
                if parent == Some(b"Device") && dev.name.is_empty() {
                    dev.name = text.to_string();
                }
            }
        }
        b"Entry" => {
            if let (Some(e), Some((_, p))) = (entry.take(), pdo.as_mut()) {
                p.entries.push(PdoEntryDef {
                    index: e.index.unwrap_or(0),
                    subindex: e.subindex,
                    bit_len: if e.bit_len == 0 { 8 } else { e.bit_len },
                });
            }
        }
        b"RxPdo" | b"TxPdo" => {
            if let (Some((is_rx, p)), Some(dev)) = (pdo.take(), device.as_mut()) {
                let built = PdoConfig {
                    index: p
                        .index
                        .ok_or_else(|| Error::Esi("PDO without Index".into()))? ,
                    entries: p.entries,
                };
                if is_rx {
                    dev.rx_pdos.push(built);
                } else {
                    dev.tx_pdos.push(built);
                }
            }
        }
        b"Device" => {
            if let Some(dev) = device.take() {
                if let Some(pc) = dev.product_code {
                    devices.push(EsiDevice {
                        name: dev.name,
                        product_code: pc,
                        revision: dev.revision,
                        rx_pdos: dev.rx_pdos,
                        tx_pdos: dev.tx_pdos,
                    });
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decode the device matching `product_code` (or the only device).
pub fn decode_esi_str(xml: &str, product_code: Option<u32>) -> Result<EsiDevice> {
    let devices = decode_devices(xml)?;
    match product_code {
        Some(pc) => devices
            .into_iter()
            .find(|d| d.product_code == pc)
            .ok_or_else(|| Error::Esi(format!("no device with product code 0x{:08X}", pc))),
        None => {
            let mut it = devices.into_iter();
            match (it.next(), it.next()) {
                (Some(d), None) => Ok(d),
                (None, _) => Err(Error::Esi("no devices in ESI file".into())),
                _ => Err(Error::Esi(
                    "multiple devices in ESI file; a product code is required".into(),
                )),
            }
        }
    }
}

pub fn decode_esi_file(path: &Path, product_code: Option<u32>) -> Result<EsiDevice> {
    let xml = fs::read_to_string(path)?;
    decode_esi_str(&xml, product_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"<?xml version="1.0"?>
<EtherCATInfo>
  <Vendor><Id>#x00000A1B</Id></Vendor>
  <Descriptions>
    <Devices>
      <Device Physics="YY">
        <Type ProductCode="#x00005081" RevisionNo="#x00000004">A6-Servo</Type>
        <Name>A6 servo drive</Name>
        <RxPdo Fixed="1" Sm="2">
          <Index>#x1600</Index>
          <Name>Outputs</Name>
          <Entry><Index>#x6040</Index><SubIndex>0</SubIndex><BitLen>16</BitLen><Name>Controlword</Name></Entry>
          <Entry><Index>#x6060</Index><SubIndex>0</SubIndex><BitLen>8</BitLen></Entry>
          <Entry><Index>#x607A</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
          <Entry><Index>#x60FF</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
          <Entry><Index>#x60B8</Index><SubIndex>0</SubIndex><BitLen>16</BitLen></Entry>
        </RxPdo>
        <TxPdo Fixed="1" Sm="3">
          <Index>#x1A00</Index>
          <Name>Inputs</Name>
          <Entry><Index>#x6041</Index><SubIndex>0</SubIndex><BitLen>16</BitLen></Entry>
          <Entry><Index>#x6061</Index><SubIndex>0</SubIndex><BitLen>8</BitLen></Entry>
          <Entry><Index>#x6064</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
          <Entry><Index>#x60B9</Index><SubIndex>0</SubIndex><BitLen>16</BitLen></Entry>
          <Entry><Index>#x60BA</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
          <Entry><Index>#x60BB</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
        </TxPdo>
      </Device>
      <Device>
        <Type ProductCode="1234h">Other</Type>
        <Name>Other device</Name>
      </Device>
    </Devices>
  </Descriptions>
</EtherCATInfo>"##;

    #[test]
    fn decodes_device_by_product_code() {
        let dev = decode_esi_str(SAMPLE, Some(0x5081)).unwrap();
        assert_eq!(dev.name, "A6 servo drive");
        assert_eq!(dev.revision, Some(4));
        assert_eq!(dev.rx_pdos.len(), 1);
        assert_eq!(dev.rx_pdos[0].index, 0x1600);
        assert_eq!(dev.rx_pdos[0].entries.len(), 5);
        assert_eq!(dev.rx_pdos[0].entries[0].index, 0x6040);
        assert_eq!(dev.rx_pdos[0].entries[0].bit_len, 16);
        assert_eq!(dev.tx_pdos[0].entries[2].index, 0x6064);
        assert_eq!(dev.tx_pdos[0].entries[2].bit_len, 32);
    }

    #[test]
    fn derives_features_and_probe_object() {
        let dev = decode_esi_str(SAMPLE, Some(0x5081)).unwrap();
        let f = dev.features();
        assert!(f.controlword_in_pdo);
        assert!(f.statusword_in_pdo);
        assert!(f.mode_command_in_pdo);
        assert!(f.mode_display_in_pdo);
        assert!(f.touch_probe);
        // This device maps the alternate negative-capture object.
        assert_eq!(dev.probe_neg_index(), Some(0x60BB));
    }

    #[test]
    fn integer_forms() {
        assert_eq!(parse_number("#x1A00").unwrap(), 0x1A00);
        assert_eq!(parse_number("0x1a00").unwrap(), 0x1A00);
        assert_eq!(parse_number("1A00h").unwrap(), 0x1A00);
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert!(parse_number("zz").is_err());
    }

    #[test]
    fn ambiguous_selection_needs_product_code() {
        assert!(decode_esi_str(SAMPLE, None).is_err());
        assert!(decode_esi_str(SAMPLE, Some(0xDEAD)).is_err());
    }

    #[test]
    fn decodes_from_file() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let dev = decode_esi_file(f.path(), Some(0x5081)).unwrap();
        assert_eq!(dev.product_code, 0x5081);
    }
}
