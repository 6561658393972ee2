//! Just enough ELF to find the binding slots of an imported symbol in every
//! object the dynamic linker has loaded.

use std::ffi::{CStr, CString};
use std::mem::size_of;

use libc::{c_char, c_int, c_void};

#[cfg(target_pointer_width = "64")]
mod types {
    pub type Word = u64;
    pub type Phdr = libc::Elf64_Phdr;

    #[repr(C)]
    pub struct Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    pub const RELA_SIZE: usize = 24;
    pub const REL_SIZE: usize = 16;

    pub fn r_sym(info: Word) -> usize {
        (info >> 32) as usize
    }

    pub fn r_type(info: Word) -> u32 {
        info as u32
    }
}

#[cfg(target_pointer_width = "32")]
mod types {
    pub type Word = u32;
    pub type Phdr = libc::Elf32_Phdr;

    #[repr(C)]
    pub struct Dyn {
        pub d_tag: i32,
        pub d_val: u32,
    }

    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: u32,
        pub st_size: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }

    pub const RELA_SIZE: usize = 12;
    pub const REL_SIZE: usize = 8;

    pub fn r_sym(info: Word) -> usize {
        (info >> 8) as usize
    }

    pub fn r_type(info: Word) -> u32 {
        info & 0xff
    }
}

use types::{Dyn, Phdr, Sym, Word};

#[cfg(target_arch = "x86_64")]
const BINDING_RELOCS: [u32; 2] = [7 /* JUMP_SLOT */, 6 /* GLOB_DAT */];
#[cfg(target_arch = "aarch64")]
const BINDING_RELOCS: [u32; 2] = [1026 /* JUMP_SLOT */, 1025 /* GLOB_DAT */];
#[cfg(target_arch = "x86")]
const BINDING_RELOCS: [u32; 2] = [7 /* JUMP_SLOT */, 6 /* GLOB_DAT */];
#[cfg(target_arch = "arm")]
const BINDING_RELOCS: [u32; 2] = [22 /* JUMP_SLOT */, 21 /* GLOB_DAT */];

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "arm"
)))]
compile_error!("binding rewrite supports x86_64, aarch64, x86 and arm");

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_RELAENT: i64 = 9;
const DT_STRSZ: i64 = 10;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_RELENT: i64 = 19;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;

/// An object as reported by `dl_iterate_phdr`.
#[derive(Clone, Debug)]
pub struct LoadedObject {
    /// Path as the linker knows it; empty for the main program.
    pub name: String,
    /// Load bias.
    pub base: usize,
    /// Runtime address of the dynamic section.
    pub dynamic: Option<usize>,
    /// Extent of the `PT_LOAD` segments.
    pub load_start: usize,
    pub load_end: usize,
}

impl LoadedObject {
    pub fn contains(&self, addr: usize) -> bool {
        self.load_start <= addr && addr < self.load_end
    }

    pub fn is_vdso(&self) -> bool {
        self.name.contains("linux-vdso") || self.name.contains("linux-gate") || self.name == "[vdso]"
    }

    /// Read the dynamic section.
    ///
    /// # Safety
    ///
    /// The object must still be loaded.
    pub unsafe fn dynamic_info(&self) -> Option<DynamicInfo> {
        let mut entry = self.dynamic? as *const Dyn;
        let mut info = DynamicInfo::default();
        let mut plt_rel = DT_RELA;
        let (mut rela_ent, mut rel_ent) = (types::RELA_SIZE, types::REL_SIZE);
        let (mut rela, mut rela_size, mut rel, mut rel_size) = (0, 0, 0, 0);
        let (mut jmprel, mut jmprel_size) = (0, 0);

        loop {
            let tag = (*entry).d_tag as i64;
            let val = (*entry).d_val as usize;
            match tag {
                DT_NULL => break,
                DT_STRTAB => info.strtab = self.absolute(val),
                DT_STRSZ => info.strsz = val,
                DT_SYMTAB => info.symtab = self.absolute(val),
                DT_JMPREL => jmprel = self.absolute(val),
                DT_PLTRELSZ => jmprel_size = val,
                DT_PLTREL => plt_rel = val as i64,
                DT_RELA => rela = self.absolute(val),
                DT_RELASZ => rela_size = val,
                DT_RELAENT => rela_ent = val,
                DT_REL => rel = self.absolute(val),
                DT_RELSZ => rel_size = val,
                DT_RELENT => rel_ent = val,
                _ => {}
            }
            entry = entry.add(1);
        }

        if info.strtab == 0 || info.symtab == 0 {
            return None;
        }
        let jmprel_ent = if plt_rel == DT_RELA { rela_ent } else { rel_ent };
        for (addr, size, stride) in [
            (jmprel, jmprel_size, jmprel_ent),
            (rela, rela_size, rela_ent),
            (rel, rel_size, rel_ent),
        ] {
            if addr != 0 && size != 0 && stride != 0 {
                info.tables.push(RelocTable { addr, size, stride });
            }
        }
        Some(info)
    }

    /// Some linkers leave dynamic-section addresses unrelocated.
    fn absolute(&self, val: usize) -> usize {
        if val < self.base {
            self.base + val
        } else {
            val
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RelocTable {
    pub addr: usize,
    pub size: usize,
    pub stride: usize,
}

#[derive(Clone, Debug, Default)]
pub struct DynamicInfo {
    pub strtab: usize,
    pub strsz: usize,
    pub symtab: usize,
    pub tables: Vec<RelocTable>,
}

/// Start shared by `Rel` and `Rela` entries.
#[repr(C)]
struct RelHead {
    r_offset: Word,
    r_info: Word,
}

impl DynamicInfo {
    /// Addresses of every jump-slot or global-data slot bound to `symbol`.
    ///
    /// # Safety
    ///
    /// `self` must describe an object that is still loaded at `base`.
    pub unsafe fn binding_slots(&self, base: usize, symbol: &CStr) -> Vec<usize> {
        let wanted = symbol.to_bytes();
        let mut slots = Vec::new();
        for table in &self.tables {
            let count = table.size / table.stride;
            for i in 0..count {
                let head = &*((table.addr + i * table.stride) as *const RelHead);
                if !BINDING_RELOCS.contains(&types::r_type(head.r_info)) {
                    continue;
                }
                let index = types::r_sym(head.r_info);
                if index == 0 {
                    continue;
                }
                if self.symbol_name(index) == Some(wanted) {
                    let slot = base + head.r_offset as usize;
                    if !slots.contains(&slot) {
                        slots.push(slot);
                    }
                }
            }
        }
        slots
    }

    unsafe fn symbol_name(&self, index: usize) -> Option<&[u8]> {
        let sym = &*((self.symtab + index * size_of::<Sym>()) as *const Sym);
        let offset = sym.st_name as usize;
        if self.strsz != 0 && offset >= self.strsz {
            return None;
        }
        Some(CStr::from_ptr((self.strtab + offset) as *const c_char).to_bytes())
    }
}

/// Snapshot of every object currently loaded, in link-map order.
pub fn loaded_objects() -> Vec<LoadedObject> {
    let mut objects: Vec<LoadedObject> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_object),
            &mut objects as *mut Vec<LoadedObject> as *mut c_void,
        );
    }
    objects
}

unsafe extern "C" fn collect_object(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    let objects = &mut *(data as *mut Vec<LoadedObject>);
    let info = &*info;
    let base = info.dlpi_addr as usize;
    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };

    let phdrs: &[Phdr] = if info.dlpi_phdr.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
    };

    let mut object = LoadedObject {
        name,
        base,
        dynamic: None,
        load_start: usize::MAX,
        load_end: 0,
    };
    for phdr in phdrs {
        let vaddr = base + phdr.p_vaddr as usize;
        match phdr.p_type {
            PT_LOAD => {
                object.load_start = object.load_start.min(vaddr);
                object.load_end = object.load_end.max(vaddr + phdr.p_memsz as usize);
            }
            PT_DYNAMIC => object.dynamic = Some(vaddr),
            _ => {}
        }
    }
    if object.load_start > object.load_end {
        object.load_start = 0;
    }
    objects.push(object);
    0
}

/// Look `symbol` up in the global scope.
pub fn resolve_default(symbol: &CStr) -> Option<usize> {
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as usize)
    }
}

/// Look `symbol` up in the objects loaded after the caller's.
pub fn resolve_next(symbol: &str) -> Option<usize> {
    let symbol = CString::new(symbol).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as usize)
    }
}
