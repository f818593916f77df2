//! A classic BPF interpreter that replays a filter stack the way the kernel
//! runs it, so policies can be checked without installing them.

use seccompiler::sock_filter;

use super::{SECCOMP_RET_ACTION_FULL, SECCOMP_RET_ALLOW, SECCOMP_RET_KILL_PROCESS, SeccompProgram};

/// `AUDIT_ARCH_X86_64`.
#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH: u32 = 0xC000_003E;
/// `AUDIT_ARCH_AARCH64`.
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH: u32 = 0xC000_00B7;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_ALU_AND_K: u16 = 0x54;
const BPF_ALU_OR_K: u16 = 0x44;
const BPF_JA: u16 = 0x05;
const BPF_JEQ_K: u16 = 0x15;
const BPF_JGT_K: u16 = 0x25;
const BPF_JGE_K: u16 = 0x35;
const BPF_JSET_K: u16 = 0x45;
const BPF_RET_K: u16 = 0x06;
const BPF_RET_A: u16 = 0x16;

const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_IP: u32 = 8;
const OFFSET_IP_HIGH: u32 = 12;
const OFFSET_ARGS: u32 = 16;

fn low(value: u64) -> u32 {
    u32::try_from(value & u64::from(u32::MAX)).unwrap_or_default()
}

fn high(value: u64) -> u32 {
    u32::try_from(value >> 32).unwrap_or_default()
}

/// Input of a filter run, laid out like `struct seccomp_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeccompData {
    /// Syscall number.
    pub nr: u32,
    /// `AUDIT_ARCH_*` value.
    pub arch: u32,
    /// Instruction pointer at the syscall.
    pub instruction_pointer: u64,
    /// Raw syscall arguments.
    pub args: [u64; 6],
}

impl SeccompData {
    /// Builds input for syscall `nr` on the native architecture.
    #[must_use]
    pub const fn new(nr: u32, args: [u64; 6]) -> Self {
        Self {
            nr,
            arch: AUDIT_ARCH,
            instruction_pointer: 0,
            args,
        }
    }

    /// The 32-bit word at `offset`, little-endian halves for 64-bit fields.
    fn word(&self, offset: u32) -> Option<u32> {
        match offset {
            OFFSET_NR => Some(self.nr),
            OFFSET_ARCH => Some(self.arch),
            OFFSET_IP => Some(low(self.instruction_pointer)),
            OFFSET_IP_HIGH => Some(high(self.instruction_pointer)),
            _ => {
                let relative = offset.checked_sub(OFFSET_ARGS)?;
                let value = *self.args.get(usize::try_from(relative >> 3).ok()?)?;
                match relative & 7 {
                    0 => Some(low(value)),
                    4 => Some(high(value)),
                    _ => None,
                }
            }
        }
    }
}

impl SeccompProgram {
    /// Runs every filter against `data` and combines the verdicts the way
    /// the kernel does: the most severe action wins, and among equally
    /// severe ones the most recently installed filter.
    #[must_use]
    pub fn evaluate(&self, data: &SeccompData) -> u32 {
        self.filters
            .iter()
            .rev()
            .map(|filter| run(filter, data))
            .fold(SECCOMP_RET_ALLOW, |verdict, next| {
                if severity(next) < severity(verdict) {
                    next
                } else {
                    verdict
                }
            })
    }
}

/// Lower is more severe; `KILL_PROCESS` is negative as a signed action.
const fn severity(verdict: u32) -> i32 {
    (verdict & SECCOMP_RET_ACTION_FULL).cast_signed()
}

/// Malformed programs and out-of-range loads kill, as the kernel's
/// verifier would refuse them.
fn run(filter: &[sock_filter], data: &SeccompData) -> u32 {
    let mut acc: u32 = 0;
    let mut pc: usize = 0;
    while let Some(insn) = filter.get(pc) {
        pc += 1;
        let skip = |taken: bool| usize::from(if taken { insn.jt } else { insn.jf });
        match insn.code {
            BPF_LD_W_ABS => match data.word(insn.k) {
                Some(word) => acc = word,
                None => return SECCOMP_RET_KILL_PROCESS,
            },
            BPF_ALU_AND_K => acc &= insn.k,
            BPF_ALU_OR_K => acc |= insn.k,
            BPF_JA => match usize::try_from(insn.k) {
                Ok(offset) => pc += offset,
                Err(_) => return SECCOMP_RET_KILL_PROCESS,
            },
            BPF_JEQ_K => pc += skip(acc == insn.k),
            BPF_JGT_K => pc += skip(acc > insn.k),
            BPF_JGE_K => pc += skip(acc >= insn.k),
            BPF_JSET_K => pc += skip(acc & insn.k != 0),
            BPF_RET_K => return insn.k,
            BPF_RET_A => return acc,
            _ => return SECCOMP_RET_KILL_PROCESS,
        }
    }
    SECCOMP_RET_KILL_PROCESS
}
