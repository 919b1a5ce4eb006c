use std::collections::HashSet;

use super::description::{FieldsDescription, RegisterDescription, TargetType};
use crate::error::{Error, Result};

/// Default register width when the description omits `bits`.
pub const DEFAULT_BITS: u32 = 32;

/// Widest register word a debugger value can hold.
pub const MAX_BITS: u32 = u64::BITS;

/// Common bit accounting for every register variant.
pub trait BitAddressable {
    /// Injectable bits in one instance.
    fn width(&self) -> u64;

    /// Number of instances (product of the array dimensions).
    fn instances(&self) -> u64;

    fn total_bits(&self) -> u64 {
        self.width() * self.instances()
    }
}

/// Named inclusive bit range inside a register word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangedField {
    pub name: String,
    pub start: u32,
    pub end: u32,
}

impl RangedField {
    pub fn bits(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, bit: u32) -> bool {
        (self.start..=self.end).contains(&bit)
    }
}

/// Bit layout of a single register word.
///
/// `bits` counts injectable bits, `actual_bits` is the physical width. They
/// differ only for partial registers, where `adjust_bit[logical]` gives the
/// physical position of each implemented bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordLayout {
    pub bits: u32,
    pub actual_bits: u32,
    pub fields: Vec<RangedField>,
    pub adjust_bit: Option<Vec<u32>>,
}

impl WordLayout {
    fn from_description(description: &RegisterDescription, context: &str) -> Result<Self> {
        let bits = description.bits.unwrap_or(DEFAULT_BITS);
        let actual_bits = description.actual_bits.unwrap_or(bits);
        if bits > MAX_BITS || actual_bits > MAX_BITS {
            return Err(Error::Config(format!(
                "register wider than {MAX_BITS} bits (bits {bits}, actual_bits {actual_bits}): {context}"
            )));
        }
        let fields: Vec<RangedField> = match &description.fields {
            None => Vec::new(),
            Some(FieldsDescription::Ranged(fields)) => fields
                .iter()
                .map(|(name, [start, end])| RangedField {
                    name: name.clone(),
                    start: *start,
                    end: *end,
                })
                .collect(),
            Some(FieldsDescription::Entry(_)) => {
                return Err(Error::Config(format!(
                    "structured fields are only allowed in tlb/gcache targets: {context}"
                )))
            }
        };
        for field in &fields {
            if field.start > field.end || field.end >= actual_bits.max(1) {
                return Err(Error::Config(format!(
                    "field {} [{}, {}] out of range for register: {context}",
                    field.name, field.start, field.end
                )));
            }
        }

        let adjust_bit = match (&description.adjust_bit, description.partial) {
            (Some(list), _) => Some(list.clone()),
            (None, true) => {
                let mut list: Vec<u32> = fields.iter().flat_map(|f| f.start..=f.end).collect();
                list.sort_unstable();
                Some(list)
            }
            (None, false) => None,
        };

        if let Some(list) = &adjust_bit {
            if list.len() != bits as usize {
                return Err(Error::Config(format!(
                    "Bits mismatch for register: {context} (bits {bits}, adjust_bit {})",
                    list.len()
                )));
            }
            let mut seen = HashSet::new();
            if list.iter().any(|bit| *bit >= actual_bits || !seen.insert(*bit)) {
                return Err(Error::Config(format!(
                    "adjust_bit entries must be distinct and below {actual_bits}: {context}"
                )));
            }
        } else if !fields.is_empty() {
            let sum: u32 = fields.iter().map(RangedField::bits).sum();
            if sum != bits {
                return Err(Error::Config(format!(
                    "field widths sum to {sum} but register has {bits} bits: {context}"
                )));
            }
        }

        Ok(Self {
            bits,
            actual_bits,
            fields,
            adjust_bit,
        })
    }

    /// Translates a logical bit index to the physical bit position.
    pub fn physical_bit(&self, logical: u32) -> u32 {
        match &self.adjust_bit {
            Some(list) => list[logical as usize],
            None => logical,
        }
    }

    pub fn field_at(&self, bit: u32) -> Option<&RangedField> {
        self.fields.iter().find(|field| field.contains(bit))
    }
}

/// How a plain register is addressed on the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAccess {
    Named,
    Spr(u32),
    Pmr(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub register: String,
    pub register_index: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainRegister {
    pub layout: WordLayout,
    pub count: Vec<usize>,
    pub access: RegisterAccess,
    pub alias: Option<Alias>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMappedRegister {
    pub layout: WordLayout,
    pub count: Vec<usize>,
    pub offset: u64,
    pub alias: Option<Alias>,
}

/// One physical slice of an entry field: word `index`, bits `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlice {
    pub index: usize,
    pub start: u32,
    pub end: u32,
}

impl EntrySlice {
    pub fn bits(&self) -> u32 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPlacement {
    Whole(EntrySlice),
    /// Field stored across two words.
    Split { high: EntrySlice, low: EntrySlice },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryField {
    pub name: String,
    pub bits: u32,
    pub placement: FieldPlacement,
}

/// TLB or cache entry. The last `count` dimension indexes the words of one
/// entry and is chosen through the field placement, not at random.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRegister {
    pub count: Vec<usize>,
    pub fields: Vec<EntryField>,
    pub alias: Option<Alias>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Register {
    Plain(PlainRegister),
    MemoryMapped(MemoryMappedRegister),
    Tlb(EntryRegister),
    Cache(EntryRegister),
}

fn alias_from(description: &RegisterDescription) -> Option<Alias> {
    description.alias.as_ref().map(|alias| Alias {
        register: alias.register.clone(),
        register_index: alias.register_index.clone(),
    })
}

fn slice(index: Option<usize>, range: Option<[u32; 2]>, bits: u32, context: &str) -> Result<EntrySlice> {
    let index = index.ok_or_else(|| Error::Config(format!("entry field without index: {context}")))?;
    let [start, end] = match range {
        Some(range) => range,
        None if bits > 0 => [0, bits - 1],
        None => return Err(Error::Config(format!("entry field without bits: {context}"))),
    };
    if end >= MAX_BITS {
        return Err(Error::Config(format!(
            "entry field range [{start}, {end}] exceeds a {MAX_BITS}-bit word: {context}"
        )));
    }
    if start > end || end - start + 1 != bits {
        return Err(Error::Config(format!(
            "entry field range [{start}, {end}] does not cover {bits} bits: {context}"
        )));
    }
    Ok(EntrySlice { index, start, end })
}

impl EntryRegister {
    fn from_description(description: &RegisterDescription, require_range: bool, context: &str) -> Result<Self> {
        let count = description.count.clone().unwrap_or_default();
        let Some(words) = count.last().copied() else {
            return Err(Error::Config(format!("entry register needs a count: {context}")));
        };
        let Some(FieldsDescription::Entry(raw_fields)) = &description.fields else {
            return Err(Error::Config(format!("entry register needs structured fields: {context}")));
        };
        let mut fields = Vec::with_capacity(raw_fields.len());
        for (name, raw) in raw_fields {
            let context = format!("{context}.{name}");
            if require_range && !raw.split && raw.bit_indicies.is_none() {
                return Err(Error::Config(format!("tlb field without bit_indicies: {context}")));
            }
            let placement = if raw.split {
                let bits_h = raw.bits_h.unwrap_or(0);
                let bits_l = raw.bits_l.unwrap_or(0);
                if bits_h + bits_l != raw.bits {
                    return Err(Error::Config(format!(
                        "split halves ({bits_h} + {bits_l}) do not add up to {}: {context}",
                        raw.bits
                    )));
                }
                FieldPlacement::Split {
                    high: slice(raw.index_h, raw.bit_indicies_h, bits_h, &context)?,
                    low: slice(raw.index_l, raw.bit_indicies_l, bits_l, &context)?,
                }
            } else {
                FieldPlacement::Whole(slice(raw.index, raw.bit_indicies, raw.bits, &context)?)
            };
            let out_of_range = match &placement {
                FieldPlacement::Whole(whole) => whole.index >= words,
                FieldPlacement::Split { high, low } => high.index >= words || low.index >= words,
            };
            if out_of_range {
                return Err(Error::Config(format!("field word index beyond entry size {words}: {context}")));
            }
            fields.push(EntryField {
                name: name.clone(),
                bits: raw.bits,
                placement,
            });
        }
        Ok(Self {
            count,
            fields,
            alias: alias_from(description),
        })
    }
}

impl Register {
    /// Builds the typed register for a target of the given type.
    pub fn from_description(kind: TargetType, description: &RegisterDescription, context: &str) -> Result<Self> {
        let count = description.count.clone().unwrap_or_default();
        if count.iter().any(|dimension| *dimension == 0) {
            return Err(Error::Config(format!("zero-sized dimension: {context}")));
        }
        Ok(match kind {
            TargetType::Plain => Register::Plain(PlainRegister {
                layout: WordLayout::from_description(description, context)?,
                count,
                access: match (description.spr, description.pmr) {
                    (Some(spr), _) => RegisterAccess::Spr(spr),
                    (None, Some(pmr)) => RegisterAccess::Pmr(pmr),
                    (None, None) => RegisterAccess::Named,
                },
                alias: alias_from(description),
            }),
            TargetType::MemoryMapped => Register::MemoryMapped(MemoryMappedRegister {
                layout: WordLayout::from_description(description, context)?,
                count,
                offset: description
                    .offset
                    .ok_or_else(|| Error::Config(format!("memory mapped register without offset: {context}")))?,
                alias: alias_from(description),
            }),
            TargetType::Tlb => Register::Tlb(EntryRegister::from_description(description, true, context)?),
            TargetType::Gcache => Register::Cache(EntryRegister::from_description(description, false, context)?),
        })
    }

    pub fn count(&self) -> &[usize] {
        match self {
            Register::Plain(register) => &register.count,
            Register::MemoryMapped(register) => &register.count,
            Register::Tlb(register) | Register::Cache(register) => &register.count,
        }
    }

    pub fn alias(&self) -> Option<&Alias> {
        match self {
            Register::Plain(register) => register.alias.as_ref(),
            Register::MemoryMapped(register) => register.alias.as_ref(),
            Register::Tlb(register) | Register::Cache(register) => register.alias.as_ref(),
        }
    }

    /// Word layout for plain and memory mapped registers.
    pub fn layout(&self) -> Option<&WordLayout> {
        match self {
            Register::Plain(register) => Some(&register.layout),
            Register::MemoryMapped(register) => Some(&register.layout),
            Register::Tlb(_) | Register::Cache(_) => None,
        }
    }

    pub fn entry(&self) -> Option<&EntryRegister> {
        match self {
            Register::Tlb(register) | Register::Cache(register) => Some(register),
            _ => None,
        }
    }
}

impl BitAddressable for WordLayout {
    fn width(&self) -> u64 {
        match &self.adjust_bit {
            Some(list) => list.len() as u64,
            None => u64::from(self.bits),
        }
    }

    fn instances(&self) -> u64 {
        1
    }
}

impl BitAddressable for EntryRegister {
    fn width(&self) -> u64 {
        self.fields.iter().map(|field| u64::from(field.bits)).sum()
    }

    fn instances(&self) -> u64 {
        let dimensions = &self.count[..self.count.len().saturating_sub(1)];
        dimensions.iter().map(|d| *d as u64).product()
    }
}

impl BitAddressable for Register {
    fn width(&self) -> u64 {
        match self {
            Register::Plain(register) => register.layout.width(),
            Register::MemoryMapped(register) => register.layout.width(),
            Register::Tlb(register) | Register::Cache(register) => register.width(),
        }
    }

    fn instances(&self) -> u64 {
        match self {
            Register::Plain(PlainRegister { count, .. })
            | Register::MemoryMapped(MemoryMappedRegister { count, .. }) => {
                count.iter().map(|d| *d as u64).product()
            }
            Register::Tlb(register) | Register::Cache(register) => register.instances(),
        }
    }
}
