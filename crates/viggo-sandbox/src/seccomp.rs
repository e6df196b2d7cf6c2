// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Seccomp BPF filter generation for the Landlock backend.
//!
//! The filter blocks a fixed denylist of syscalls a tool subprocess has no
//! business making (mount manipulation, reboot, tracing, root pivoting).
//! Everything else is allowed: the namespaces and bind mounts carry the
//! actual containment, the filter removes the escape hatches.

/// One classic BPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

// BPF opcode constants (linux/bpf_common.h).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

/// Syscall numbers denied inside the sandbox (x86_64 numbering).
#[cfg(target_arch = "x86_64")]
pub const DENIED_SYSCALLS: &[(u32, &str)] = &[
    (165, "mount"),
    (166, "umount2"),
    (169, "reboot"),
    (246, "kexec_load"),
    (101, "ptrace"),
    (155, "pivot_root"),
];

#[cfg(target_arch = "aarch64")]
pub const DENIED_SYSCALLS: &[(u32, &str)] = &[
    (40, "mount"),
    (39, "umount2"),
    (142, "reboot"),
    (104, "kexec_load"),
    (117, "ptrace"),
    (41, "pivot_root"),
];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const DENIED_SYSCALLS: &[(u32, &str)] = &[];

/// Build the filter program.
///
/// Structure: load the syscall number from offset 0 of `seccomp_data`, then
/// one JEQ per denied number whose true-branch jumps over the remaining
/// compares *and* the ALLOW return, landing on the terminal KILL.
pub fn build_filter() -> Vec<SockFilter> {
    let denied = DENIED_SYSCALLS;
    let mut prog = Vec::with_capacity(denied.len() + 3);

    // ld [0] — seccomp_data.nr
    prog.push(SockFilter {
        code: BPF_LD | BPF_W | BPF_ABS,
        jt: 0,
        jf: 0,
        k: 0,
    });

    for (i, (nr, _)) in denied.iter().enumerate() {
        let remaining = (denied.len() - 1 - i) as u8;
        prog.push(SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: remaining + 1,
            jf: 0,
            k: *nr,
        });
    }

    prog.push(SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k: SECCOMP_RET_ALLOW,
    });
    prog.push(SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k: SECCOMP_RET_KILL_PROCESS,
    });
    prog
}

/// Serialize the program for handing to the isolation wrapper over fd 9.
pub fn serialize_filter(prog: &[SockFilter]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(prog.len() * 8);
    for insn in prog {
        bytes.extend_from_slice(&insn.code.to_ne_bytes());
        bytes.push(insn.jt);
        bytes.push(insn.jf);
        bytes.extend_from_slice(&insn.k.to_ne_bytes());
    }
    bytes
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_has_load_compares_allow_kill() {
        let prog = build_filter();
        assert_eq!(prog.len(), DENIED_SYSCALLS.len() + 3);
        // First instruction loads the syscall nr from offset 0.
        assert_eq!(prog[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(prog[0].k, 0);
        // Last two are ALLOW then KILL.
        let allow = prog[prog.len() - 2];
        let kill = prog[prog.len() - 1];
        assert_eq!(allow.code, BPF_RET | BPF_K);
        assert_eq!(allow.k, SECCOMP_RET_ALLOW);
        assert_eq!(kill.code, BPF_RET | BPF_K);
        assert_eq!(kill.k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn every_compare_jumps_to_kill() {
        let prog = build_filter();
        let kill_idx = prog.len() - 1;
        for (i, insn) in prog.iter().enumerate().skip(1).take(DENIED_SYSCALLS.len()) {
            assert_eq!(insn.code, BPF_JMP | BPF_JEQ | BPF_K);
            // jt is relative to the *next* instruction.
            assert_eq!(
                i + 1 + insn.jt as usize,
                kill_idx,
                "compare {i} must land on the KILL instruction"
            );
            assert_eq!(insn.jf, 0, "false branch falls through");
        }
    }

    #[test]
    fn compares_cover_the_denylist_in_order() {
        let prog = build_filter();
        let nrs: Vec<u32> = prog[1..1 + DENIED_SYSCALLS.len()].iter().map(|i| i.k).collect();
        let expected: Vec<u32> = DENIED_SYSCALLS.iter().map(|(nr, _)| *nr).collect();
        assert_eq!(nrs, expected);
    }

    #[test]
    fn serialization_is_eight_bytes_per_insn() {
        let prog = build_filter();
        let bytes = serialize_filter(&prog);
        assert_eq!(bytes.len(), prog.len() * 8);
    }
}
