//! Seccomp filters compiled with `seccompiler`.
//!
//! Policies are first-match tables: for each syscall the first rule whose
//! conditions hold decides. A `seccompiler` filter carries a single match
//! action, so a policy compiles to a stack of filters:
//!
//! 1. one filter per non-allow action, matching exactly the calls whose
//!    first matching rule carries that action and allowing the rest,
//! 2. a base filter, installed last, that allows every call some rule
//!    matches and applies the default action to everything else.
//!
//! The kernel runs every filter in the stack and keeps the most severe
//! verdict, which reproduces the first-match table. Each filter only sees
//! the calls laid out for it, so rule order is encoded by negating the
//! earlier rules of the same syscall into later ones.

use std::collections::BTreeMap;

use seccompiler::{
    BackendError, BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter, SeccompRule, TargetArch, apply_filter,
};

use crate::error::PolicyError;
use crate::rule::{Action, ArgCheck, ArgCondition, SyscallRule};

#[cfg(any(test, feature = "test-support"))]
mod eval;

#[cfg(any(test, feature = "test-support"))]
pub use eval::{AUDIT_ARCH, SeccompData};

/// Kill the whole process.
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
/// Fail with the errno in the low 16 bits.
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
/// Stop for the tracer, passing the low 16 bits as the event message.
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
/// Run the syscall.
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
/// Mask selecting the action part of a return value.
pub const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
/// Mask selecting the data part of a return value.
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

/// Event message of the trace stop a violation raises.
pub const VIOLATION_TRACE_DATA: u32 = 1;

/// Largest single filter the kernel accepts.
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Largest filter stack the kernel accepts, counting four instructions of
/// overhead per filter.
pub const MAX_STACK_INSTRUCTIONS: usize = 32_768;

const STACK_OVERHEAD: usize = 4;

/// Alternatives a single syscall may expand to in one filter.
pub const MAX_ALTERNATIVES: usize = 256;

#[cfg(target_arch = "x86_64")]
const TARGET_ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const TARGET_ARCH: TargetArch = TargetArch::aarch64;

const MAX_ERRNO: u16 = 4095;

/// A single 64-bit comparison `seccompiler` can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Comparison {
    arg: u8,
    op: Op,
    value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    MaskedEq(u64),
}

impl Comparison {
    const fn new(arg: u8, op: Op, value: u64) -> Self {
        Self { arg, op, value }
    }

    fn to_condition(self) -> Result<SeccompCondition, BackendError> {
        let op = match self.op {
            Op::Eq => SeccompCmpOp::Eq,
            Op::Ne => SeccompCmpOp::Ne,
            Op::MaskedEq(mask) => SeccompCmpOp::MaskedEq(mask),
        };
        SeccompCondition::new(self.arg, SeccompCmpArgLen::Qword, op, self.value)
    }
}

/// Alternatives of which at least one must hold; each is a list of
/// comparisons that must all hold. No alternatives means never, one empty
/// alternative means always.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Alternatives(Vec<Vec<Comparison>>);

impl Alternatives {
    fn always() -> Self {
        Self(vec![Vec::new()])
    }

    const fn never() -> Self {
        Self(Vec::new())
    }

    const fn is_never(&self) -> bool {
        self.0.is_empty()
    }

    fn is_always(&self) -> bool {
        self.0.iter().any(Vec::is_empty)
    }

    fn each_bit(mask: u64, mut comparison: impl FnMut(u64) -> Comparison) -> Self {
        Self(
            (0..u64::BITS)
                .map(|shift| 1_u64 << shift)
                .filter(|bit| mask & bit != 0)
                .map(|bit| vec![comparison(bit)])
                .collect(),
        )
    }

    /// Calls satisfying `condition`.
    fn holding(condition: &ArgCondition) -> Self {
        let arg = condition.arg();
        match condition.check() {
            ArgCheck::Equals(value) => Self(vec![vec![Comparison::new(arg, Op::Eq, value)]]),
            ArgCheck::NotEquals(value) => Self(vec![vec![Comparison::new(arg, Op::Ne, value)]]),
            ArgCheck::MaskedEquals { mask, value } => Self(vec![vec![Comparison::new(
                arg,
                Op::MaskedEq(mask),
                value & mask,
            )]]),
            ArgCheck::HasAnyBits(mask) => {
                Self::each_bit(mask, |bit| Comparison::new(arg, Op::MaskedEq(bit), bit))
            }
        }
    }

    /// Calls violating `condition`.
    fn violating(condition: &ArgCondition) -> Self {
        let arg = condition.arg();
        match condition.check() {
            ArgCheck::Equals(value) => Self(vec![vec![Comparison::new(arg, Op::Ne, value)]]),
            ArgCheck::NotEquals(value) => Self(vec![vec![Comparison::new(arg, Op::Eq, value)]]),
            ArgCheck::MaskedEquals { mask, value } => Self::each_bit(mask, |bit| {
                Comparison::new(arg, Op::MaskedEq(bit), !value & bit)
            }),
            ArgCheck::HasAnyBits(mask) => {
                Self(vec![vec![Comparison::new(arg, Op::MaskedEq(mask), 0)]])
            }
        }
    }

    /// Calls `rule` matches.
    fn matching(rule: &SyscallRule) -> Result<Self, PolicyError> {
        rule.conditions()
            .iter()
            .try_fold(Self::always(), |acc, condition| {
                acc.and(&Self::holding(condition), rule.nr())
            })
    }

    /// Calls `rule` does not match.
    fn missing(rule: &SyscallRule) -> Result<Self, PolicyError> {
        let mut missing = Self::never();
        for condition in rule.conditions() {
            missing.or(Self::violating(condition), rule.nr())?;
        }
        Ok(missing)
    }

    fn and(&self, other: &Self, nr: u32) -> Result<Self, PolicyError> {
        let count = self.0.len().saturating_mul(other.0.len());
        if count > MAX_ALTERNATIVES {
            return Err(PolicyError::TooManyAlternatives { nr, count });
        }
        let product = self
            .0
            .iter()
            .flat_map(|left| {
                other
                    .0
                    .iter()
                    .map(move |right| left.iter().chain(right).copied().collect())
            })
            .collect();
        Ok(Self(product))
    }

    fn or(&mut self, other: Self, nr: u32) -> Result<(), PolicyError> {
        for alternative in other.0 {
            if !self.0.contains(&alternative) {
                self.0.push(alternative);
            }
        }
        let count = self.0.len();
        if count > MAX_ALTERNATIVES {
            return Err(PolicyError::TooManyAlternatives { nr, count });
        }
        Ok(())
    }

    /// Rules in the form `seccompiler` expects: an empty list matches
    /// unconditionally.
    fn into_rules(self) -> Result<Vec<SeccompRule>, BackendError> {
        if self.is_always() {
            return Ok(Vec::new());
        }
        self.0
            .into_iter()
            .map(|alternative| {
                let conditions = alternative
                    .into_iter()
                    .map(Comparison::to_condition)
                    .collect::<Result<Vec<_>, _>>()?;
                SeccompRule::new(conditions)
            })
            .collect()
    }
}

type RuleTable = BTreeMap<u32, Alternatives>;

/// A compiled, installable stack of seccomp filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeccompProgram {
    filters: Vec<BpfProgram>,
}

impl SeccompProgram {
    /// Compiles `rules` and `default` into a filter stack.
    ///
    /// Rules are grouped by syscall; within a syscall the first rule whose
    /// conditions all hold decides.
    ///
    /// # Errors
    ///
    /// Fails when an argument index or errno is out of range, a syscall
    /// expands to more than [`MAX_ALTERNATIVES`] alternatives, or the stack
    /// exceeds the kernel's instruction limits.
    pub fn compile(rules: &[SyscallRule], default: Action) -> Result<Self, PolicyError> {
        validate_action(0, default)?;
        let mut groups: BTreeMap<u32, Vec<&SyscallRule>> = BTreeMap::new();
        for rule in rules {
            validate_rule(rule)?;
            groups.entry(rule.nr()).or_default().push(rule);
        }

        let mut stacked: BTreeMap<Action, RuleTable> = BTreeMap::new();
        let mut base = RuleTable::new();
        for (&nr, group) in &groups {
            let claimed = split_group(nr, group, &mut stacked)?;
            if !claimed.is_never() {
                base.insert(nr, claimed);
            }
        }

        let mut filters = Vec::with_capacity(stacked.len() + 1);
        for (action, table) in stacked {
            filters.push(assemble(table, SeccompAction::Allow, seccomp_action(action))?);
        }
        let base_filter = if default == Action::Allow {
            // Matching never happens on an empty table; only the
            // architecture check remains.
            assemble(RuleTable::new(), SeccompAction::Allow, SeccompAction::KillProcess)?
        } else {
            assemble(base, seccomp_action(default), SeccompAction::Allow)?
        };
        filters.push(base_filter);
        check_limits(&filters)?;
        Ok(Self { filters })
    }

    /// The filters in installation order.
    #[must_use]
    pub fn filters(&self) -> &[BpfProgram] {
        &self.filters
    }

    /// Total number of instructions across the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.iter().map(Vec::len).sum()
    }

    /// Returns `true` for an empty stack, which [`SeccompProgram::compile`]
    /// never produces.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Sets `PR_SET_NO_NEW_PRIVS` and installs every filter on the calling
    /// thread, base filter last.
    ///
    /// Performs no allocation on success, so it may run between `fork` and
    /// `exec`.
    ///
    /// # Errors
    ///
    /// Returns the first `prctl` or `seccomp` failure.
    pub fn install(&self) -> Result<(), seccompiler::Error> {
        for filter in &self.filters {
            apply_filter(filter)?;
        }
        Ok(())
    }
}

/// Files the calls of `group` whose first matching rule does not allow under
/// that rule's action, and returns every call some rule of `group` matches.
fn split_group(
    nr: u32,
    group: &[&SyscallRule],
    stacked: &mut BTreeMap<Action, RuleTable>,
) -> Result<Alternatives, PolicyError> {
    // Ordering only matters up to the last rule that does not allow.
    let last_claim = group.iter().rposition(|rule| rule.action() != Action::Allow);
    // Calls no earlier rule has claimed. The stacked filters also see the
    // installs of the filters after them, which must go through.
    let mut unclaimed = Alternatives::always();
    if last_claim.is_some() {
        for install in install_rules().iter().filter(|install| install.nr() == nr) {
            unclaimed = unclaimed.and(&Alternatives::missing(install)?, nr)?;
        }
    }
    let mut claimed = Alternatives::never();
    for (index, rule) in group.iter().enumerate() {
        let matching = Alternatives::matching(rule)?;
        if rule.action() != Action::Allow {
            let first = unclaimed.and(&matching, nr)?;
            if !first.is_never() {
                stacked
                    .entry(rule.action())
                    .or_default()
                    .entry(nr)
                    .or_insert_with(Alternatives::never)
                    .or(first, nr)?;
            }
        }
        if last_claim.is_some_and(|last| index < last) {
            unclaimed = unclaimed.and(&Alternatives::missing(rule)?, nr)?;
        }
        claimed.or(matching, nr)?;
    }
    Ok(claimed)
}

fn check_limits(filters: &[BpfProgram]) -> Result<(), PolicyError> {
    let mut total = 0_usize;
    for filter in filters {
        if filter.len() > MAX_INSTRUCTIONS {
            return Err(PolicyError::ProgramTooLong {
                len: filter.len(),
                max: MAX_INSTRUCTIONS,
            });
        }
        total = total.saturating_add(filter.len() + STACK_OVERHEAD);
    }
    if total > MAX_STACK_INSTRUCTIONS {
        return Err(PolicyError::ProgramTooLong {
            len: total,
            max: MAX_STACK_INSTRUCTIONS,
        });
    }
    Ok(())
}

fn assemble(
    table: RuleTable,
    mismatch: SeccompAction,
    matched: SeccompAction,
) -> Result<BpfProgram, PolicyError> {
    let mut rules = BTreeMap::new();
    for (nr, alternatives) in table {
        rules.insert(i64::from(nr), alternatives.into_rules().map_err(backend)?);
    }
    let filter = SeccompFilter::new(rules, mismatch, matched, TARGET_ARCH).map_err(backend)?;
    filter.try_into().map_err(backend)
}

fn backend(error: BackendError) -> PolicyError {
    PolicyError::Backend(error.to_string())
}

fn seccomp_action(action: Action) -> SeccompAction {
    match action {
        Action::Allow => SeccompAction::Allow,
        Action::Errno(errno) => SeccompAction::Errno(u32::from(errno)),
        Action::Kill => SeccompAction::KillProcess,
        Action::Violation => SeccompAction::Trace(VIOLATION_TRACE_DATA),
    }
}

/// The calls [`apply_filter`] makes for each filter after the first.
fn install_rules() -> [SyscallRule; 2] {
    let no_new_privs = u64::from(libc::PR_SET_NO_NEW_PRIVS.cast_unsigned());
    let mode_filter = u64::from(libc::SECCOMP_SET_MODE_FILTER);
    [
        SyscallRule::new(crate::syscalls::nr(libc::SYS_prctl), Action::Allow)
            .when(ArgCondition::equals(0, no_new_privs)),
        SyscallRule::new(crate::syscalls::nr(libc::SYS_seccomp), Action::Allow)
            .when(ArgCondition::equals(0, mode_filter)),
    ]
}

fn validate_action(nr: u32, action: Action) -> Result<(), PolicyError> {
    match action {
        Action::Errno(errno) if errno > MAX_ERRNO => Err(PolicyError::InvalidErrno { nr, errno }),
        _ => Ok(()),
    }
}

fn validate_rule(rule: &SyscallRule) -> Result<(), PolicyError> {
    validate_action(rule.nr(), rule.action())?;
    rule.conditions()
        .iter()
        .find(|condition| condition.arg() > 5)
        .map_or(Ok(()), |condition| {
            Err(PolicyError::InvalidArgIndex {
                nr: rule.nr(),
                index: condition.arg(),
            })
        })
}
