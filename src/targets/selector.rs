use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use super::{BitAddressable, Catalog, FieldPlacement, Register, Target};
use crate::error::{Error, Result};

/// Concrete bit chosen for one injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionSite {
    pub target: String,
    pub target_index: Option<usize>,
    pub register: String,
    pub register_alias: Option<String>,
    pub register_index: Vec<usize>,
    pub field: Option<String>,
    pub bit: u32,
    pub core: usize,
}

/// Locates `point` inside consecutive ranges of the given widths.
///
/// Returns the index of the range containing `point` and the offset of
/// `point` inside that range, or `None` if `point` lies beyond the sum.
pub fn cumulative_pick<I>(weights: I, point: u64) -> Option<(usize, u64)>
where
    I: IntoIterator<Item = u64>,
{
    let mut sum = 0u64;
    for (index, weight) in weights.into_iter().enumerate() {
        if point < sum + weight {
            return Some((index, point - sum));
        }
        sum += weight;
    }
    None
}

/// Uniform-by-bit random walk over a [`Catalog`].
///
/// The random source is injected so campaigns and tests can replay a
/// sequence of selections from a seed.
pub struct InjectionSelector<R: Rng = ChaCha20Rng> {
    rng: R,
    target_indices: Option<Vec<usize>>,
}

impl InjectionSelector<ChaCha20Rng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(ChaCha20Rng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(ChaCha20Rng::from_entropy())
    }
}

impl<R: Rng> InjectionSelector<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            target_indices: None,
        }
    }

    /// Restricts array targets to the given instance indices.
    pub fn with_target_indices(mut self, indices: Option<Vec<usize>>) -> Self {
        self.target_indices = indices;
        self
    }

    pub fn rng(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Chooses one bit, weighting every level by its addressable bits.
    pub fn choose(&mut self, catalog: &Catalog) -> Result<InjectionSite> {
        let total = catalog.total_bits();
        if total == 0 {
            return Err(Error::Selection("catalog has no addressable bits".to_string()));
        }
        let targets: Vec<&Target> = catalog.targets().collect();
        let point = self.rng.gen_range(0..total);
        let (target_position, _) = cumulative_pick(targets.iter().map(|target| target.total_bits()), point)
            .ok_or_else(|| Error::Selection("Error choosing injection target".to_string()))?;
        let target = targets[target_position];

        let target_index = match target.instances() > 1 {
            true => Some(self.choose_target_index(target)?),
            false => None,
        };

        let registers: Vec<(&String, &Register)> = target.registers.iter().collect();
        let register_total: u64 = registers.iter().map(|(_, register)| register.total_bits()).sum();
        if register_total == 0 {
            return Err(Error::Selection(format!("target {} has no addressable bits", target.name)));
        }
        let point = self.rng.gen_range(0..register_total);
        let (register_position, _) =
            cumulative_pick(registers.iter().map(|(_, register)| register.total_bits()), point).ok_or_else(|| {
                Error::Selection(format!("Error choosing register for target: {}", target.name))
            })?;
        let (register_name, register) = registers[register_position];

        let mut register_index: Vec<usize> = register
            .count()
            .iter()
            .map(|dimension| self.rng.gen_range(0..*dimension))
            .collect();
        let mut register_alias = None;
        if let Some(alias) = register.alias() {
            register_alias = Some(alias.register.clone());
            if let Some(index) = &alias.register_index {
                register_index = index.clone();
            }
        }

        let (field, bit) = match register {
            Register::Plain(_) | Register::MemoryMapped(_) => {
                let layout = register
                    .layout()
                    .ok_or_else(|| Error::Selection(format!("{register_name} has no word layout")))?;
                let logical = self.rng.gen_range(0..layout.width()) as u32;
                let bit = layout.physical_bit(logical);
                let field = match layout.fields.is_empty() {
                    true => None,
                    false => Some(
                        layout
                            .field_at(bit)
                            .ok_or_else(|| {
                                Error::Selection(format!(
                                    "Error finding register field name for target: {}, register: {}, bit: {}",
                                    target.name, register_name, bit
                                ))
                            })?
                            .name
                            .clone(),
                    ),
                };
                (field, bit)
            }
            Register::Tlb(entry) | Register::Cache(entry) => {
                let point = self.rng.gen_range(0..entry.width());
                let (field_position, _) = cumulative_pick(entry.fields.iter().map(|f| u64::from(f.bits)), point)
                    .ok_or_else(|| Error::Selection(format!("Error choosing field for {register_name}")))?;
                let field = &entry.fields[field_position];
                let slice = match &field.placement {
                    FieldPlacement::Whole(slice) => *slice,
                    FieldPlacement::Split { high, low } => {
                        let draw = self.rng.gen_range(0..high.bits() + low.bits());
                        match draw < low.bits() {
                            true => *low,
                            false => *high,
                        }
                    }
                };
                let word = register_index
                    .last_mut()
                    .ok_or_else(|| Error::Selection(format!("{register_name} has no word dimension")))?;
                *word = slice.index;
                let bit = self.rng.gen_range(slice.start..=slice.end);
                (Some(field.name.clone()), bit)
            }
        };

        let core = self.rng.gen_range(0..catalog.cores.max(1));

        Ok(InjectionSite {
            target: target.name.clone(),
            target_index,
            register: register_name.clone(),
            register_alias,
            register_index,
            field,
            bit,
            core,
        })
    }

    fn choose_target_index(&mut self, target: &Target) -> Result<usize> {
        match &self.target_indices {
            None => Ok(self.rng.gen_range(0..target.instances())),
            Some(allowed) => {
                let eligible: Vec<usize> = (0..target.instances()).filter(|index| allowed.contains(index)).collect();
                eligible
                    .choose(&mut self.rng)
                    .copied()
                    .ok_or_else(|| Error::Selection(format!("invalid selected target indices for {}", target.name)))
            }
        }
    }
}
