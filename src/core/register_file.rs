//! Register bookkeeping for kernel register assignment.
//!
//! This module implements the RegisterFile the AssignRegisters pass uses to hand out
//! physical registers from the target's pools, track which value owns each register and
//! remember every register that was ever written so the kernel prologue knows what to save.
//! There is no spilling: snippet kernels are small enough that exhausting a pool is reported
//! as an allocation failure for the whole subgraph.

use std::fmt;

use super::error::{Result, SnippetsError};

/// Maximum number of register banks supported (GP, vector).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 64;

/// Register id within a bank.
pub type RegId = u8;

/// Register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegType {
    Gpr = 0,
    Vec = 1,
}

impl RegType {
    fn index(self) -> usize {
        self as usize
    }
}

/// Physical register handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub bank: RegType,
    pub id: RegId,
}

impl Reg {
    pub const fn new(bank: RegType, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gpr(id: RegId) -> Self {
        Self::new(RegType::Gpr, id)
    }

    pub const fn vec(id: RegId) -> Self {
        Self::new(RegType::Vec, id)
    }

    /// Linear register index for array indexing.
    pub fn linear_index(&self) -> usize {
        self.bank.index() * MAX_REGISTERS_PER_BANK + self.id as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            RegType::Gpr => write!(f, "gpr{}", self.id),
            RegType::Vec => write!(f, "vec{}", self.id),
        }
    }
}

/// Bit set for tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set containing every register of the given list.
    pub fn from_regs(regs: &[Reg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    pub fn contains(&self, reg: Reg) -> bool {
        (self.banks[reg.bank.index()] & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: Reg) {
        self.banks[reg.bank.index()] |= 1u64 << reg.id;
    }

    pub fn clear(&mut self, reg: Reg) {
        self.banks[reg.bank.index()] &= !(1u64 << reg.id);
    }

    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    /// Lowest register of the bank that is in `self` but not in `exclude`.
    pub fn find_first_in_bank(&self, bank: RegType, exclude: &RegBitSet) -> Option<Reg> {
        let available = self.banks[bank.index()] & !exclude.banks[bank.index()];
        if available == 0 {
            return None;
        }
        Some(Reg::new(bank, available.trailing_zeros() as RegId))
    }

    pub fn count_in_bank(&self, bank: RegType) -> u32 {
        self.banks[bank.index()].count_ones()
    }

    /// Registers of the bank in ascending id order.
    pub fn iter_bank(&self, bank: RegType) -> impl Iterator<Item = Reg> + '_ {
        let bits = self.banks[bank.index()];
        (0..MAX_REGISTERS_PER_BANK as u8)
            .filter(move |id| bits & (1u64 << id) != 0)
            .map(move |id| Reg::new(bank, id))
    }

    pub fn clear_all(&mut self) {
        self.banks.fill(0);
    }
}

/// Owner of an allocated register: an abstract value id chosen by the allocator.
pub type RegOwner = usize;

/// RegisterFile manages register ownership for a single kernel.
pub struct RegisterFile {
    /// Registers available for allocation (the target's pools).
    allocatable: RegBitSet,
    /// Currently allocated registers.
    used: RegBitSet,
    /// Every register that was allocated at least once.
    clobbered: RegBitSet,
    /// Which value owns each register.
    owners: Vec<Option<RegOwner>>,
}

impl RegisterFile {
    /// Create a register file over the given GP and vector pools.
    pub fn new(gp_pool: &[Reg], vec_pool: &[Reg]) -> Self {
        let mut allocatable = RegBitSet::from_regs(gp_pool);
        allocatable.union(&RegBitSet::from_regs(vec_pool));
        Self {
            allocatable,
            used: RegBitSet::new(),
            clobbered: RegBitSet::new(),
            owners: vec![None; MAX_REGISTER_BANKS * MAX_REGISTERS_PER_BANK],
        }
    }

    /// Allocate the lowest free register of the bank.
    pub fn allocate_reg(&mut self, bank: RegType, owner: RegOwner) -> Result<Reg> {
        let reg = self
            .allocatable
            .find_first_in_bank(bank, &self.used)
            .ok_or_else(|| SnippetsError::RegisterAllocation {
                reason: format!(
                    "no free {:?} register for value {owner} ({} in pool, all live)",
                    bank,
                    self.allocatable.count_in_bank(bank)
                ),
            })?;
        self.assign_register(reg, owner);
        Ok(reg)
    }

    /// Claim a specific register, e.g. an ABI argument register.
    pub fn allocate_fixed(&mut self, reg: Reg, owner: RegOwner) -> Result<()> {
        if !self.allocatable.contains(reg) {
            return Err(SnippetsError::RegisterAllocation {
                reason: format!("{reg} is not allocatable"),
            });
        }
        if self.used.contains(reg) {
            return Err(SnippetsError::RegisterAllocation {
                reason: format!("{reg} is already owned by value {:?}", self.owner(reg)),
            });
        }
        self.assign_register(reg, owner);
        Ok(())
    }

    fn assign_register(&mut self, reg: Reg, owner: RegOwner) {
        self.used.set(reg);
        self.clobbered.set(reg);
        self.owners[reg.linear_index()] = Some(owner);
    }

    /// Release a register.
    pub fn free_register(&mut self, reg: Reg) -> Result<()> {
        if !self.used.contains(reg) {
            return Err(SnippetsError::RegisterAllocation {
                reason: format!("{reg} is not allocated"),
            });
        }
        self.used.clear(reg);
        self.owners[reg.linear_index()] = None;
        Ok(())
    }

    pub fn owner(&self, reg: Reg) -> Option<RegOwner> {
        self.owners[reg.linear_index()]
    }

    pub fn is_allocated(&self, reg: Reg) -> bool {
        self.used.contains(reg)
    }

    /// Registers written at least once since the last reset.
    pub fn clobbered(&self) -> RegBitSet {
        self.clobbered
    }

    /// Register usage for a bank: (used, total).
    pub fn bank_usage(&self, bank: RegType) -> (u32, u32) {
        (self.used.count_in_bank(bank), self.allocatable.count_in_bank(bank))
    }

    pub fn reset(&mut self) {
        self.used.clear_all();
        self.clobbered.clear_all();
        self.owners.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_regfile() -> RegisterFile {
        let gp: Vec<Reg> = (0..4).map(Reg::gpr).collect();
        let vec: Vec<Reg> = (0..8).map(Reg::vec).collect();
        RegisterFile::new(&gp, &vec)
    }

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = Reg::vec(5);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        assert!(!set.contains(Reg::gpr(5)));
        set.clear(reg);
        assert!(!set.contains(reg));
    }

    #[test]
    fn test_register_allocation() {
        let mut regfile = create_test_regfile();

        let reg1 = regfile.allocate_reg(RegType::Vec, 100).unwrap();
        let reg2 = regfile.allocate_reg(RegType::Vec, 101).unwrap();
        assert_eq!(reg1, Reg::vec(0));
        assert_eq!(reg2, Reg::vec(1));
        assert_eq!(regfile.owner(reg1), Some(100));
        assert_eq!(regfile.owner(reg2), Some(101));

        regfile.free_register(reg1).unwrap();
        assert!(!regfile.is_allocated(reg1));
        assert!(regfile.clobbered().contains(reg1));
        // Lowest free register is reused first.
        assert_eq!(regfile.allocate_reg(RegType::Vec, 102).unwrap(), reg1);
    }

    #[test]
    fn test_exhausted_pool() {
        let mut regfile = create_test_regfile();
        for owner in 0..4 {
            regfile.allocate_reg(RegType::Gpr, owner).unwrap();
        }
        let (used, total) = regfile.bank_usage(RegType::Gpr);
        assert_eq!((used, total), (4, 4));
        let err = regfile.allocate_reg(RegType::Gpr, 4).unwrap_err();
        assert!(matches!(err, SnippetsError::RegisterAllocation { .. }));
    }

    #[test]
    fn test_fixed_allocation() {
        let mut regfile = create_test_regfile();
        regfile.allocate_fixed(Reg::gpr(2), 7).unwrap();
        assert!(regfile.allocate_fixed(Reg::gpr(2), 8).is_err());
        assert!(regfile.allocate_fixed(Reg::gpr(9), 8).is_err());
        assert_eq!(regfile.allocate_reg(RegType::Gpr, 9).unwrap(), Reg::gpr(0));
    }
}
