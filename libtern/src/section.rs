use crate::relaxation::RelaxAux;
use crate::relocation::Relocation;
use linker_utils::elf::shf;
use linker_utils::elf::SectionFlags;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// An input relocatable object. Parsing happens upstream; the backend only
/// needs the name (for diagnostics) and the ELF header flags.
#[derive(Debug, Clone)]
pub struct InputObject {
    pub name: String,
    pub eflags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSectionId(u32);

impl InputSectionId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for InputSectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An input section after address assignment. `data` is owned: relaxation
/// replaces it with a freshly allocated, shrunk copy during finalisation.
#[derive(Debug)]
pub struct InputSection {
    pub name: String,
    pub object: ObjectId,
    pub address: u64,
    pub alignment: u64,
    pub flags: SectionFlags,
    pub data: Vec<u8>,
    /// Sorted by offset. Two records may share an offset only when the second
    /// is a relaxation hint for the first.
    pub relocations: Vec<Relocation>,
    /// Bytes the current relaxation pass removed. Folded into `data` and reset
    /// by finalisation.
    pub bytes_dropped: u32,
    pub(crate) relax_aux: Option<RelaxAux>,
}

impl InputSection {
    pub fn new(name: impl Into<String>, object: ObjectId, flags: SectionFlags) -> Self {
        Self {
            name: name.into(),
            object,
            address: 0,
            alignment: 1,
            flags,
            data: Vec::new(),
            relocations: Vec::new(),
            bytes_dropped: 0,
            relax_aux: None,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.flags.contains(shf::EXECINSTR)
    }

    /// Current size, accounting for bytes dropped by in-flight relaxation.
    pub fn size(&self) -> u64 {
        self.data.len() as u64 - u64::from(self.bytes_dropped)
    }
}

/// An output section: an address, flags, and the input sections assigned to
/// it in layout order.
#[derive(Debug)]
pub struct OutputSection {
    pub name: String,
    pub address: u64,
    pub flags: SectionFlags,
    pub sections: Vec<InputSectionId>,
}

impl OutputSection {
    pub fn new(name: impl Into<String>, address: u64, flags: SectionFlags) -> Self {
        Self {
            name: name.into(),
            address,
            flags,
            sections: Vec::new(),
        }
    }

    pub fn is_executable(&self) -> bool {
        self.flags.contains(shf::EXECINSTR)
    }
}
