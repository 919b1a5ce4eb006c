//! Serde mirror of the catalog JSON files.
//!
//! These types follow the on-disk layout one to one. Backend overlays are
//! applied on this level before the description is converted into the typed
//! [`Target`](super::Target) model.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::deserializers::{deserialize_hex, deserialize_hex_option};
use crate::error::{Error, Result};

fn default_cores() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogDescription {
    #[serde(default = "default_cores")]
    pub cores: usize,
    pub targets: BTreeMap<String, TargetDescription>,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendOverlay>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    Plain,
    MemoryMapped,
    Tlb,
    Gcache,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetDescription {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default, rename = "type")]
    pub kind: TargetType,
    #[serde(default, deserialize_with = "deserialize_hex")]
    pub base: Vec<u64>,
    pub registers: BTreeMap<String, RegisterDescription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterDescription {
    #[serde(default)]
    pub bits: Option<u32>,
    #[serde(default)]
    pub actual_bits: Option<u32>,
    #[serde(default)]
    pub count: Option<Vec<usize>>,
    #[serde(default)]
    pub fields: Option<FieldsDescription>,
    #[serde(default)]
    pub alias: Option<AliasDescription>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub adjust_bit: Option<Vec<u32>>,
    #[serde(default, deserialize_with = "deserialize_hex_option")]
    pub offset: Option<u64>,
    #[serde(default, rename = "SPR")]
    pub spr: Option<u32>,
    #[serde(default, rename = "PMR")]
    pub pmr: Option<u32>,
}

/// Ranged fields (`[name, [start, end]]`) for plain registers, structured
/// per-entry fields for TLB and cache registers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldsDescription {
    Ranged(Vec<(String, [u32; 2])>),
    Entry(BTreeMap<String, EntryFieldDescription>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryFieldDescription {
    pub bits: u32,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub bit_indicies: Option<[u32; 2]>,
    #[serde(default)]
    pub split: bool,
    #[serde(default)]
    pub bits_h: Option<u32>,
    #[serde(default)]
    pub bits_l: Option<u32>,
    #[serde(default)]
    pub index_h: Option<usize>,
    #[serde(default)]
    pub index_l: Option<usize>,
    #[serde(default)]
    pub bit_indicies_h: Option<[u32; 2]>,
    #[serde(default)]
    pub bit_indicies_l: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasDescription {
    pub register: String,
    #[serde(default)]
    pub register_index: Option<Vec<usize>>,
}

/// Per-backend removals (e.g. registers the JTAG debugger cannot reach).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendOverlay {
    #[serde(default)]
    pub unused_targets: Vec<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetOverlay>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetOverlay {
    #[serde(default)]
    pub unused_registers: Vec<String>,
    #[serde(default)]
    pub registers: BTreeMap<String, RegisterOverlay>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterOverlay {
    #[serde(default)]
    pub unused_fields: Vec<String>,
    /// Attributes replacing those of the base register.
    #[serde(flatten)]
    pub update: RegisterUpdate,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterUpdate {
    #[serde(default)]
    pub bits: Option<u32>,
    #[serde(default)]
    pub actual_bits: Option<u32>,
    #[serde(default)]
    pub count: Option<Vec<usize>>,
    #[serde(default)]
    pub fields: Option<FieldsDescription>,
    #[serde(default)]
    pub alias: Option<AliasDescription>,
    #[serde(default)]
    pub partial: Option<bool>,
    #[serde(default)]
    pub adjust_bit: Option<Vec<u32>>,
    #[serde(default, deserialize_with = "deserialize_hex_option")]
    pub offset: Option<u64>,
    #[serde(default, rename = "SPR")]
    pub spr: Option<u32>,
    #[serde(default, rename = "PMR")]
    pub pmr: Option<u32>,
}

impl RegisterUpdate {
    fn apply(self, register: &mut RegisterDescription) {
        if self.bits.is_some() {
            register.bits = self.bits;
        }
        if self.actual_bits.is_some() {
            register.actual_bits = self.actual_bits;
        }
        if self.count.is_some() {
            register.count = self.count;
        }
        if self.fields.is_some() {
            register.fields = self.fields;
        }
        if self.alias.is_some() {
            register.alias = self.alias;
        }
        if let Some(partial) = self.partial {
            register.partial = partial;
        }
        if self.adjust_bit.is_some() {
            register.adjust_bit = self.adjust_bit;
        }
        if self.offset.is_some() {
            register.offset = self.offset;
        }
        if self.spr.is_some() {
            register.spr = self.spr;
        }
        if self.pmr.is_some() {
            register.pmr = self.pmr;
        }
    }
}

impl CatalogDescription {
    /// Applies a backend overlay: removes what it marks as unused and
    /// replaces the register attributes it gives.
    ///
    /// Attributes are replaced before fields are dropped. Dropping fields from a ranged register turns it into a partial
    /// register: the physical width moves to `actual_bits` and `bits` becomes
    /// the number of bits still covered by fields.
    pub fn apply_overlay(&mut self, backend: &str) -> Result<()> {
        let Some(overlay) = self.backends.get(backend).cloned() else {
            return Ok(());
        };
        for name in &overlay.unused_targets {
            self.targets.remove(name);
        }
        for (target_name, target_overlay) in overlay.targets {
            let Some(target) = self.targets.get_mut(&target_name) else {
                continue;
            };
            for name in &target_overlay.unused_registers {
                target.registers.remove(name);
            }
            for (register_name, register_overlay) in target_overlay.registers {
                let Some(register) = target.registers.get_mut(&register_name) else {
                    continue;
                };
                register_overlay.update.apply(register);
                if register_overlay.unused_fields.is_empty() {
                    continue;
                }
                let Some(FieldsDescription::Ranged(fields)) = &register.fields else {
                    return Err(Error::Config(format!(
                        "unused fields given for register without ranged fields: {target_name}.{register_name}"
                    )));
                };
                let kept: Vec<(String, [u32; 2])> = fields
                    .iter()
                    .filter(|(name, _)| !register_overlay.unused_fields.contains(name))
                    .cloned()
                    .collect();
                let bits = kept.iter().map(|(_, [start, end])| end - start + 1).sum();
                register.actual_bits = Some(register.bits.unwrap_or(32));
                register.bits = Some(bits);
                register.partial = true;
                register.adjust_bit = None;
                register.fields = Some(FieldsDescription::Ranged(kept));
            }
        }
        self.targets.retain(|_, target| !target.registers.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "cores": 2,
        "targets": {
            "CPU": {
                "registers": {
                    "msr": {"fields": [["EE", [0, 15]], ["PR", [16, 31]]]},
                    "pir": {}
                }
            },
            "L2": {"type": "gcache", "registers": {"tag": {"count": [4, 1], "fields": {"tag": {"bits": 20, "index": 0}}}}}
        },
        "backends": {
            "jtag": {
                "unused_targets": ["L2"],
                "targets": {"CPU": {"registers": {"msr": {"unused_fields": ["EE"]}}}}
            },
            "simics": {
                "targets": {
                    "CPU": {"registers": {"pir": {"bits": 16, "alias": {"register": "pir0"}, "offset": "0x40"}}},
                    "L2": {"registers": {"tag": {"count": [8, 2]}}}
                }
            }
        }
    }"#;

    #[test]
    fn overlay_makes_register_partial() {
        let mut description: CatalogDescription = serde_json::from_str(SAMPLE).unwrap();
        description.apply_overlay("jtag").unwrap();
        assert!(!description.targets.contains_key("L2"));
        let msr = &description.targets["CPU"].registers["msr"];
        assert!(msr.partial);
        assert_eq!(msr.bits, Some(16));
        assert_eq!(msr.actual_bits, Some(32));
    }

    #[test]
    fn overlay_replaces_register_attributes() {
        let mut description: CatalogDescription = serde_json::from_str(SAMPLE).unwrap();
        description.apply_overlay("simics").unwrap();
        let pir = &description.targets["CPU"].registers["pir"];
        assert_eq!(pir.bits, Some(16));
        assert_eq!(pir.offset, Some(0x40));
        assert_eq!(pir.alias.as_ref().map(|alias| alias.register.as_str()), Some("pir0"));
        assert!(!pir.partial);
        let tag = &description.targets["L2"].registers["tag"];
        assert_eq!(tag.count, Some(vec![8, 2]));
        assert!(matches!(tag.fields, Some(FieldsDescription::Entry(_))));
        let msr = &description.targets["CPU"].registers["msr"];
        assert_eq!(msr.bits, None);
    }

    #[test]
    fn unknown_backend_is_noop() {
        let mut description: CatalogDescription = serde_json::from_str(SAMPLE).unwrap();
        description.apply_overlay("gem5").unwrap();
        assert_eq!(description.targets.len(), 2);
        assert_eq!(description.cores, 2);
    }
}
