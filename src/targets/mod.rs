//! Addressable bit space of an architecture.
//!
//! A [`Catalog`] is built once per campaign from a JSON description, trimmed
//! by backend overlays and operator allow-lists, and then shared read-only by
//! the injection selector and the debugger links.

pub mod description;
pub mod register;
pub mod selector;

use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use description::{CatalogDescription, TargetType};
pub use register::{
    Alias, BitAddressable, EntryField, EntryRegister, EntrySlice, FieldPlacement, MemoryMappedRegister,
    PlainRegister, RangedField, Register, RegisterAccess, WordLayout,
};
pub use selector::{cumulative_pick, InjectionSelector, InjectionSite};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Plain,
    MemoryMapped { base: Vec<u64> },
    Tlb,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub count: Option<usize>,
    pub kind: TargetKind,
    pub registers: BTreeMap<String, Register>,
    total_bits: u64,
}

impl Target {
    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    pub fn instances(&self) -> usize {
        self.count.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub architecture: String,
    pub cores: usize,
    targets: BTreeMap<String, Target>,
}

/// Wire-level address of one register instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegisterLocation {
    pub target: String,
    pub target_index: Option<usize>,
    /// Register name after alias resolution.
    pub register: String,
    pub register_index: Vec<usize>,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Named,
    Spr(u32),
    Pmr(u32),
    Memory { address: u64, bits: u32 },
    TlbEntry,
    CacheEntry,
}

impl RegisterLocation {
    /// Register name with its indices appended, e.g. `ivor15`.
    pub fn wire_name(&self) -> String {
        self.register_index
            .iter()
            .fold(self.register.clone(), |name, index| format!("{name}{index}"))
    }
}

impl std::fmt::Display for RegisterLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.target)?;
        if let Some(index) = self.target_index {
            write!(f, "[{index}]")?;
        }
        write!(f, ".{}", self.register)?;
        for index in &self.register_index {
            write!(f, "[{index}]")?;
        }
        Ok(())
    }
}

impl Catalog {
    /// Loads `<dir>/<architecture>.json` and applies the overlay for `backend`.
    pub fn load(dir: &Path, architecture: &str, backend: &str) -> Result<Self> {
        let path = dir.join(format!("{architecture}.json"));
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read catalog {}: {}", path.display(), e)))?;
        Self::from_json(architecture, &content, backend)
    }

    pub fn from_json(architecture: &str, json: &str, backend: &str) -> Result<Self> {
        let mut description: CatalogDescription = serde_json::from_str(json)?;
        description.apply_overlay(backend)?;
        Self::from_description(architecture, description)
    }

    fn from_description(architecture: &str, description: CatalogDescription) -> Result<Self> {
        if description.cores == 0 {
            return Err(Error::Config("catalog must declare at least one core".to_string()));
        }
        let mut targets = BTreeMap::new();
        for (name, target) in description.targets {
            let kind = match target.kind {
                TargetType::Plain => TargetKind::Plain,
                TargetType::MemoryMapped => {
                    let instances = target.count.unwrap_or(1);
                    if target.base.len() < instances {
                        return Err(Error::Config(format!(
                            "memory mapped target {name} has {} base addresses for {instances} instances",
                            target.base.len()
                        )));
                    }
                    TargetKind::MemoryMapped { base: target.base.clone() }
                }
                TargetType::Tlb => TargetKind::Tlb,
                TargetType::Gcache => TargetKind::Cache,
            };
            if target.count == Some(0) {
                return Err(Error::Config(format!("target {name} has a zero count")));
            }
            let mut registers = BTreeMap::new();
            for (register_name, register) in &target.registers {
                let context = format!("{name}.{register_name}");
                registers.insert(
                    register_name.clone(),
                    Register::from_description(target.kind, register, &context)?,
                );
            }
            targets.insert(
                name.clone(),
                Target {
                    name,
                    count: target.count,
                    kind,
                    registers,
                    total_bits: 0,
                },
            );
        }
        Ok(Self {
            architecture: architecture.to_string(),
            cores: description.cores,
            targets,
        }
        .compute_bit_totals())
    }

    /// Removes every target/register outside the allow-lists.
    ///
    /// `None` permits everything. Names are compared case-insensitively and
    /// a name that does not exist anywhere in the catalog is rejected.
    pub fn restrict(&self, allowed_targets: Option<&[String]>, allowed_registers: Option<&[String]>) -> Result<Self> {
        let mut restricted = self.clone();

        if let Some(allowed) = allowed_targets {
            let allowed: Vec<String> = allowed.iter().map(|name| name.to_lowercase()).collect();
            let invalid: Vec<&str> = allowed
                .iter()
                .filter(|name| !self.targets.keys().any(|target| target.to_lowercase() == **name))
                .map(String::as_str)
                .collect();
            if !invalid.is_empty() {
                return Err(Error::InvalidSelection(format!("invalid selected targets: {}", invalid.join(", "))));
            }
            restricted.targets.retain(|name, _| allowed.contains(&name.to_lowercase()));
        }

        if let Some(allowed) = allowed_registers {
            let allowed: Vec<String> = allowed.iter().map(|name| name.to_lowercase()).collect();
            let invalid: Vec<&str> = allowed
                .iter()
                .filter(|name| {
                    !restricted
                        .targets
                        .values()
                        .any(|target| target.registers.keys().any(|register| register.to_lowercase() == **name))
                })
                .map(String::as_str)
                .collect();
            if !invalid.is_empty() {
                return Err(Error::InvalidSelection(format!(
                    "invalid selected registers: {}",
                    invalid.join(", ")
                )));
            }
            for target in restricted.targets.values_mut() {
                target.registers.retain(|name, _| allowed.contains(&name.to_lowercase()));
            }
        }

        Ok(restricted.compute_bit_totals())
    }

    /// Recomputes target totals, dropping registers without addressable bits
    /// and targets left without registers.
    pub fn compute_bit_totals(mut self) -> Self {
        for target in self.targets.values_mut() {
            target.registers.retain(|name, register| {
                let keep = register.total_bits() > 0;
                if !keep {
                    debug!("Dropping register without addressable bits: {}.{}", target.name, name);
                }
                keep
            });
            let sum: u64 = target.registers.values().map(BitAddressable::total_bits).sum();
            target.total_bits = sum * target.instances() as u64;
        }
        self.targets.retain(|_, target| !target.registers.is_empty());
        self
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn total_bits(&self) -> u64 {
        self.targets.values().map(Target::total_bits).sum()
    }

    /// Resolves a chosen site into the address used on the wire.
    pub fn locate(&self, site: &InjectionSite) -> Result<RegisterLocation> {
        let target = self
            .target(&site.target)
            .ok_or_else(|| Error::Selection(format!("unknown target {}", site.target)))?;
        let register = target
            .registers
            .get(&site.register)
            .ok_or_else(|| Error::Selection(format!("unknown register {}.{}", site.target, site.register)))?;
        let name = site.register_alias.clone().unwrap_or_else(|| site.register.clone());
        let access = match (register, &target.kind) {
            (Register::Plain(plain), _) => match plain.access {
                RegisterAccess::Named => Access::Named,
                RegisterAccess::Spr(number) => Access::Spr(number),
                RegisterAccess::Pmr(number) => Access::Pmr(number),
            },
            (Register::MemoryMapped(mapped), TargetKind::MemoryMapped { base }) => {
                let base = base
                    .get(site.target_index.unwrap_or(0))
                    .ok_or_else(|| Error::Selection(format!("no base address for {}", site.target)))?;
                Access::Memory {
                    address: base + mapped.offset,
                    bits: mapped.layout.actual_bits,
                }
            }
            (Register::MemoryMapped(_), _) => {
                return Err(Error::Selection(format!("{} is not memory mapped", site.target)))
            }
            (Register::Tlb(_), _) => Access::TlbEntry,
            (Register::Cache(_), _) => Access::CacheEntry,
        };
        Ok(RegisterLocation {
            target: site.target.clone(),
            target_index: site.target_index,
            register: name,
            register_index: site.register_index.clone(),
            access,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const P2020_SAMPLE: &str = r#"{
        "cores": 2,
        "targets": {
            "GPR": {"registers": {"r0": {}, "r1": {}, "egpr0": {"bits": 64}}},
            "SPR": {"registers": {
                "hid0": {"SPR": 1008, "fields": [["EMCP", [0, 0]], ["RSV", [1, 30]], ["NOPTI", [31, 31]]]},
                "pir": {"alias": {"register": "pir_alias"}}
            }},
            "DDR": {"type": "memory_mapped", "count": 2, "base": ["0xFFE02000", "0xFFE03000"],
                    "registers": {"ddr_cfg": {"offset": "0x110", "bits": 16}}},
            "TLB1": {"type": "tlb", "registers": {"entry": {"count": [4, 3], "fields": {
                "V": {"bits": 1, "index": 0, "bit_indicies": [31, 31]},
                "RPN": {"bits": 24, "split": true, "bits_h": 4, "bits_l": 20,
                        "index_h": 2, "bit_indicies_h": [0, 3],
                        "index_l": 1, "bit_indicies_l": [12, 31]}
            }}}}
        }
    }"#;

    pub(crate) fn sample() -> Catalog {
        Catalog::from_json("p2020", P2020_SAMPLE, "jtag").unwrap()
    }

    #[test]
    fn totals_follow_counts() {
        let catalog = sample();
        assert_eq!(catalog.target("GPR").unwrap().total_bits(), 32 + 32 + 64);
        assert_eq!(catalog.target("DDR").unwrap().total_bits(), 16 * 2);
        assert_eq!(catalog.target("TLB1").unwrap().total_bits(), 25 * 4);
        for target in catalog.targets() {
            let sum: u64 = target.registers.values().map(BitAddressable::total_bits).sum();
            assert_eq!(sum * target.instances() as u64, target.total_bits());
        }
    }

    #[test]
    fn restrict_rejects_unknown_names() {
        let catalog = sample();
        let result = catalog.restrict(Some(&["gpr".to_string(), "nope".to_string()]), None);
        assert!(matches!(result, Err(Error::InvalidSelection(_))));
        let result = catalog.restrict(None, Some(&["r9".to_string()]));
        assert!(matches!(result, Err(Error::InvalidSelection(_))));
    }

    #[test]
    fn restrict_is_idempotent() {
        let catalog = sample();
        let targets = vec!["GPR".to_string(), "spr".to_string()];
        let registers = vec!["R0".to_string(), "hid0".to_string()];
        let once = catalog.restrict(Some(&targets), Some(&registers)).unwrap();
        let twice = once.restrict(Some(&targets), Some(&registers)).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.total_bits(), 64);
        assert!(once.target("SPR").unwrap().registers.get("pir").is_none());
    }

    #[test]
    fn restriction_drops_empty_targets() {
        let catalog = sample();
        let restricted = catalog.restrict(None, Some(&["egpr0".to_string()])).unwrap();
        assert_eq!(restricted.targets().count(), 1);
        assert_eq!(restricted.total_bits(), 64);
    }

    #[test]
    fn locate_memory_mapped_uses_target_base() {
        let catalog = sample();
        let site = InjectionSite {
            target: "DDR".to_string(),
            target_index: Some(1),
            register: "ddr_cfg".to_string(),
            register_alias: None,
            register_index: vec![],
            field: None,
            bit: 3,
            core: 0,
        };
        let location = catalog.locate(&site).unwrap();
        assert_eq!(
            location.access,
            Access::Memory {
                address: 0xFFE0_3110,
                bits: 16
            }
        );
        assert_eq!(location.to_string(), "DDR[1].ddr_cfg");
    }

    #[test]
    fn memory_mapped_needs_base_per_instance() {
        let json = r#"{"targets": {"LAW": {"type": "memory_mapped", "count": 2, "base": [4096],
            "registers": {"lawar0": {"offset": 16}}}}}"#;
        assert!(matches!(Catalog::from_json("p2020", json, "jtag"), Err(Error::Config(_))));
    }

    #[test]
    fn vector_registers_do_not_load() {
        let json = r#"{"targets": {"VEC": {"registers": {"v0": {"bits": 128}}}}}"#;
        assert!(matches!(Catalog::from_json("p2020", json, "jtag"), Err(Error::Config(_))));
    }
}
