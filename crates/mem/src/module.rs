//! Loaded-module lookup
//!
//! Base address and image size of modules in the current process, used to
//! bound signature scans and resolve `(module, offset)` hook targets.

use crate::address::Address;

/// A loaded module image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Module {
    base: Address,
    size: usize,
}

impl Module {
    pub fn from_raw(base: Address, size: usize) -> Module {
        Module { base, size }
    }

    /// The main executable image of the current process.
    pub fn current() -> Option<Module> {
        os::current()
    }

    /// A module loaded under `name` (e.g. `"kernel32.dll"`).
    #[cfg(windows)]
    pub fn named(name: &str) -> Option<Module> {
        os::named(name)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// Resolves an offset from the module base.
    pub fn at(&self, offset: usize) -> Address {
        self.base + offset
    }
}

#[cfg(windows)]
mod os {
    use super::{Address, Module};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;

    fn describe(handle: HMODULE) -> Option<Module> {
        let mut info = MODULEINFO::default();
        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                handle,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        }
        .ok()?;
        Some(Module {
            base: Address::from_mut_ptr(info.lpBaseOfDll),
            size: info.SizeOfImage as usize,
        })
    }

    pub fn current() -> Option<Module> {
        let handle = unsafe { GetModuleHandleW(PCWSTR::null()) }.ok()?;
        describe(handle)
    }

    pub fn named(name: &str) -> Option<Module> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe { GetModuleHandleW(PCWSTR::from_raw(wide.as_ptr())) }.ok()?;
        describe(handle)
    }
}

#[cfg(target_os = "linux")]
mod os {
    use super::{Address, Module};

    #[cfg(target_pointer_width = "64")]
    type Phdr = libc::Elf64_Phdr;
    #[cfg(target_pointer_width = "32")]
    type Phdr = libc::Elf32_Phdr;

    /// Base and extent of the main image from the program headers the
    /// kernel hands us through the auxiliary vector.
    pub fn current() -> Option<Module> {
        unsafe {
            let phdr = libc::getauxval(libc::AT_PHDR) as *const Phdr;
            let phnum = libc::getauxval(libc::AT_PHNUM) as usize;
            if phdr.is_null() || phnum == 0 {
                return None;
            }

            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(phdr.cast(), &mut info) == 0 || info.dli_fbase.is_null() {
                return None;
            }
            let base = Address::from_mut_ptr(info.dli_fbase);

            let mut lowest = u64::MAX;
            let mut highest = 0u64;
            for i in 0..phnum {
                let header = &*phdr.add(i);
                if header.p_type != libc::PT_LOAD {
                    continue;
                }
                lowest = lowest.min(header.p_vaddr as u64);
                highest = highest.max(header.p_vaddr as u64 + header.p_memsz as u64);
            }
            if highest == 0 {
                return None;
            }
            Some(Module {
                base,
                size: (highest - lowest) as usize,
            })
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod os {
    use super::Module;

    pub fn current() -> Option<Module> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_module() {
        let module = Module::current().expect("main image not found");
        assert!(module.base().valid());
        assert!(module.size() > 0);
        assert_eq!(module.at(0x10), module.base() + 0x10);
    }

    #[test]
    fn test_contains() {
        let module = Module::from_raw(Address::new(0x1000), 0x2000);
        assert!(module.contains(Address::new(0x1000)));
        assert!(module.contains(Address::new(0x2fff)));
        assert!(!module.contains(Address::new(0x3000)));
    }
}
