use crate::config::Config;
use crate::section::InputObject;
use crate::section::InputSection;
use crate::section::InputSectionId;
use crate::section::ObjectId;
use crate::section::OutputSection;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use crate::symbol::SymbolPlacement;
use crate::symbol::SymbolTable;
use linker_utils::elf::shf;
use std::cell::Cell;

/// Addresses of the synthetic sections the backend writes into. Layout
/// assigns these; the backend only reads them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticAddresses {
    pub plt: u64,
    pub got_plt: u64,
    /// Address of the `_DYNAMIC` symbol (start of `.dynamic`).
    pub dynamic: u64,
    pub captable: u64,
}

/// Everything the backend needs for one link invocation. There is no global
/// state: the context is threaded through every entry point and dropped when
/// the link is done.
pub struct LinkContext {
    pub config: Config,
    pub objects: Vec<InputObject>,
    pub sections: Vec<InputSection>,
    pub output_sections: Vec<OutputSection>,
    pub symbols: SymbolTable,
    pub synthetic: SyntheticAddresses,
    /// Base address the compartment globals pointer is sealed to.
    pub cgp_base: u64,
    /// Start of the TLS block; TP-relative values are offsets from here.
    pub tls_base: u64,
    /// Latched when a `R_RISCV_TLS_GOT_HI20` is classified: the static TLS
    /// model constrains the dynamic tags the embedding linker may emit.
    pub has_static_tls_model: Cell<bool>,
}

impl LinkContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            objects: Vec::new(),
            sections: Vec::new(),
            output_sections: Vec::new(),
            symbols: SymbolTable::new(),
            synthetic: SyntheticAddresses::default(),
            cgp_base: 0,
            tls_base: 0,
            has_static_tls_model: Cell::new(false),
        }
    }

    pub fn add_object(&mut self, object: InputObject) -> ObjectId {
        let id = ObjectId::from_usize(self.objects.len());
        self.objects.push(object);
        id
    }

    /// Adds an input section and appends it to the given output section.
    pub fn add_section(&mut self, output: usize, section: InputSection) -> InputSectionId {
        let id = InputSectionId::from_usize(self.sections.len());
        self.sections.push(section);
        self.output_sections[output].sections.push(id);
        id
    }

    pub fn add_output_section(&mut self, section: OutputSection) -> usize {
        self.output_sections.push(section);
        self.output_sections.len() - 1
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.add(symbol)
    }

    pub fn section(&self, id: InputSectionId) -> &InputSection {
        &self.sections[id.as_usize()]
    }

    pub fn section_mut(&mut self, id: InputSectionId) -> &mut InputSection {
        &mut self.sections[id.as_usize()]
    }

    /// The symbol's virtual address with the current section addresses.
    pub fn symbol_address(&self, id: SymbolId) -> u64 {
        symbol_address_in(&self.sections, &self.symbols, id)
    }

    /// Whether the symbol is reachable through the program-counter capability
    /// rather than the compartment globals pointer. Text and read-only data
    /// sit under PCC; writable compartment globals under CGP.
    pub fn is_pcc_relative(&self, id: SymbolId) -> bool {
        is_pcc_relative_in(&self.sections, &self.symbols, id)
    }

    /// Repacks input sections within each output section, honouring alignment
    /// and accounting for bytes dropped by relaxation. Runs after every
    /// relaxation pass that changed anything.
    pub fn reassign_section_addresses(&mut self) {
        let Self {
            output_sections,
            sections,
            ..
        } = self;
        for osec in output_sections.iter() {
            let mut cursor = osec.address;
            for &id in &osec.sections {
                let sec = &mut sections[id.as_usize()];
                let alignment = sec.alignment.max(1);
                cursor = (cursor + alignment - 1) & !(alignment - 1);
                sec.address = cursor;
                cursor += sec.size();
            }
        }
    }
}

pub(crate) fn symbol_address_in(
    sections: &[InputSection],
    symbols: &SymbolTable,
    id: SymbolId,
) -> u64 {
    let symbol = &symbols[id];
    match symbol.placement {
        SymbolPlacement::Undefined => 0,
        SymbolPlacement::Absolute => symbol.value,
        SymbolPlacement::Section(section) => sections[section.as_usize()]
            .address
            .wrapping_add(symbol.value),
    }
}

pub(crate) fn is_pcc_relative_in(
    sections: &[InputSection],
    symbols: &SymbolTable,
    id: SymbolId,
) -> bool {
    match symbols[id].placement {
        SymbolPlacement::Section(section) => {
            !sections[section.as_usize()].flags.contains(shf::WRITE)
        }
        _ => false,
    }
}
