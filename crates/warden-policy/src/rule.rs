//! Syscall rules and argument predicates.

/// What the filter does with a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    /// Let the syscall proceed.
    Allow,
    /// Fail the syscall with this errno without running it.
    Errno(u16),
    /// Kill the whole process immediately.
    Kill,
    /// Stop the process and report the syscall to the monitor, which then
    /// kills it.
    Violation,
}

/// A 64-bit comparison against one syscall argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCheck {
    /// `arg == value`.
    Equals(u64),
    /// `arg & mask == value & mask`.
    MaskedEquals {
        /// Bits that take part in the comparison.
        mask: u64,
        /// Expected value of those bits.
        value: u64,
    },
    /// `arg & mask != 0`.
    HasAnyBits(u64),
    /// `arg != value`.
    NotEquals(u64),
}

/// A predicate on syscall argument `arg` (0..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgCondition {
    arg: u8,
    check: ArgCheck,
}

impl ArgCondition {
    /// `arg == value`.
    #[must_use]
    pub const fn equals(arg: u8, value: u64) -> Self {
        Self {
            arg,
            check: ArgCheck::Equals(value),
        }
    }

    /// `arg & mask == value & mask`.
    #[must_use]
    pub const fn masked_equals(arg: u8, mask: u64, value: u64) -> Self {
        Self {
            arg,
            check: ArgCheck::MaskedEquals { mask, value },
        }
    }

    /// `arg & mask != 0`.
    #[must_use]
    pub const fn has_any_bits(arg: u8, mask: u64) -> Self {
        Self {
            arg,
            check: ArgCheck::HasAnyBits(mask),
        }
    }

    /// `arg != value`.
    #[must_use]
    pub const fn not_equals(arg: u8, value: u64) -> Self {
        Self {
            arg,
            check: ArgCheck::NotEquals(value),
        }
    }

    /// Argument index.
    #[must_use]
    pub const fn arg(&self) -> u8 {
        self.arg
    }

    /// Comparison applied to the argument.
    #[must_use]
    pub const fn check(&self) -> ArgCheck {
        self.check
    }

    /// Evaluates the predicate against concrete arguments.
    #[must_use]
    pub fn holds(&self, args: &[u64; 6]) -> bool {
        let Some(&value) = args.get(usize::from(self.arg)) else {
            return false;
        };
        match self.check {
            ArgCheck::Equals(expected) => value == expected,
            ArgCheck::MaskedEquals { mask, value: expected } => value & mask == expected & mask,
            ArgCheck::HasAnyBits(mask) => value & mask != 0,
            ArgCheck::NotEquals(expected) => value != expected,
        }
    }
}

/// Conditions plus the action taken when all of them hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgRule {
    conditions: Vec<ArgCondition>,
    action: Action,
}

impl ArgRule {
    /// Creates an unconditional rule.
    #[must_use]
    pub const fn new(action: Action) -> Self {
        Self {
            conditions: Vec::new(),
            action,
        }
    }

    /// Adds a condition; all conditions must hold.
    #[must_use]
    pub fn when(mut self, condition: ArgCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub(crate) fn into_syscall_rule(self, nr: u32) -> SyscallRule {
        SyscallRule {
            nr,
            conditions: self.conditions,
            action: self.action,
        }
    }
}

/// A rule bound to one syscall number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallRule {
    nr: u32,
    conditions: Vec<ArgCondition>,
    action: Action,
}

impl SyscallRule {
    /// Creates an unconditional rule for `nr`.
    #[must_use]
    pub const fn new(nr: u32, action: Action) -> Self {
        Self {
            nr,
            conditions: Vec::new(),
            action,
        }
    }

    /// Adds a condition; all conditions must hold.
    #[must_use]
    pub fn when(mut self, condition: ArgCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Syscall number.
    #[must_use]
    pub const fn nr(&self) -> u32 {
        self.nr
    }

    /// Conditions, all of which must hold.
    #[must_use]
    pub fn conditions(&self) -> &[ArgCondition] {
        &self.conditions
    }

    /// Action taken when the rule matches.
    #[must_use]
    pub const fn action(&self) -> Action {
        self.action
    }

    /// Returns `true` when every condition holds for `args`.
    #[must_use]
    pub fn matches(&self, args: &[u64; 6]) -> bool {
        self.conditions.iter().all(|condition| condition.holds(args))
    }
}
