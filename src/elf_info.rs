//! Just enough ELF introspection to find a traced binary's entry point
//! (SPEC_FULL.md §C.3). Uses `goblin`, already part of the teacher's
//! dependency table, rather than hand-parsing ELF headers.

use goblin::elf::Elf;
use std::fs;

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    /// `ET_EXEC`: entry point is an absolute virtual address.
    Static,
    /// `ET_DYN`: entry point is relative to the load bias reported by
    /// `/proc/<pid>/maps` for the binary's first mapping.
    PositionIndependent,
}

#[derive(Debug, Clone)]
pub struct ElfInfo {
    pub entry: u64,
    pub kind: ExecKind,
}

pub fn read_elf_info(path: &str) -> Result<ElfInfo, HarnessError> {
    let bytes = fs::read(path).map_err(HarnessError::Io)?;
    let elf = Elf::parse(&bytes).map_err(|e| HarnessError::Elf(e.to_string()))?;

    let kind = match elf.header.e_type {
        goblin::elf::header::ET_EXEC => ExecKind::Static,
        goblin::elf::header::ET_DYN => ExecKind::PositionIndependent,
        other => {
            return Err(HarnessError::Elf(format!(
                "unsupported ELF e_type {} (only ET_EXEC/ET_DYN traced binaries are supported)",
                other
            )))
        }
    };

    Ok(ElfInfo {
        entry: elf.entry,
        kind,
    })
}

/// Resolves the absolute entry point for a tracee that has just reached
/// its initial stop. For `ET_DYN` binaries this needs the binary's load
/// bias: the lowest mapped address backed by `path` in the tracee's own
/// maps, found by the caller via [`crate::proc_maps::read_maps`].
pub fn absolute_entry(info: &ElfInfo, load_bias: u64) -> u64 {
    match info.kind {
        ExecKind::Static => info.entry,
        ExecKind::PositionIndependent => load_bias + info.entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_entry_is_absolute() {
        let info = ElfInfo {
            entry: 0x0040_1000,
            kind: ExecKind::Static,
        };
        assert_eq!(absolute_entry(&info, 0x5555_0000_0000), 0x0040_1000);
    }

    #[test]
    fn pie_entry_is_bias_relative() {
        let info = ElfInfo {
            entry: 0x1000,
            kind: ExecKind::PositionIndependent,
        };
        assert_eq!(absolute_entry(&info, 0x5555_0000_0000), 0x5555_0000_1000);
    }

    #[test]
    fn reads_own_test_binary_as_elf() {
        // The currently-running test binary is itself a valid ELF file on
        // any platform this crate targets.
        let exe = std::env::current_exe().unwrap();
        let info = read_elf_info(exe.to_str().unwrap()).unwrap();
        assert!(info.entry != 0);
    }
}
