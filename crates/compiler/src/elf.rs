//! ET_DYN shared-object writer.
//!
//! Hand-written on purpose: the consumer's test harness diffs these objects
//! against GNU ld's output byte for byte, so both the `.dynsym` ordering
//! (ld buckets symbols through its BFD string hash, 4051 buckets, chains
//! reversed per bucket) and the `.got.plt` placement (the three reserved
//! slots end 0x18 bytes before a page boundary) are part of the contract.
//! No linker library can guarantee either, so bytes are pushed directly and
//! placeholder fields are patched once the layout is final.
//!
//! File order: ELF header, 7 program headers, `.hash`, `.dynsym`,
//! `.dynstr`, `.rela.dyn`, `.rela.plt`, page gap, `.plt`, `.text`, page gap
//! (`.eh_frame` is empty), `.dynamic`, `.got`, `.got.plt`, `.data`,
//! `.symtab`, `.strtab`, `.shstrtab`, section headers. Sections with no
//! content are omitted entirely, together with their headers.

use std::collections::HashMap;

use grug_core::abi;
use grug_core::hash::{bfd_order, elf_hash};

use crate::codegen::ObjectCode;
use crate::error::{Result, bail, ensure};
use crate::modapi::Entity;

// ELF constants, straight from the System V gABI
const ET_DYN: u8 = 3;
const EM_X86_64: u8 = 0x3e;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_HASH: u32 = 5;
const SHT_DYNAMIC: u32 = 6;
const SHT_DYNSYM: u32 = 11;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_INFO_LINK: u64 = 0x40;

const SHN_UNDEF: u16 = 0;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_GNU_STACK: u32 = 0x6474_e551;
const PT_GNU_RELRO: u32 = 0x6474_e552;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

const DT_NULL: u64 = 0;
const DT_PLTRELSZ: u64 = 2;
const DT_PLTGOT: u64 = 3;
const DT_HASH: u64 = 4;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_PLTREL: u64 = 20;
const DT_JMPREL: u64 = 23;
const DT_RELACOUNT: u64 = 0x6fff_fff9;

const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;

const RELA_ENTRY_SIZE: usize = 24;
const SYMTAB_ENTRY_SIZE: usize = 24;
const PLT_ENTRY_SIZE: usize = 24;

// A recent ld update places the three reserved .got.plt slots so they end
// 0x18 bytes before the start of a new page; the tester diffs against ld,
// so the same placement is reproduced here.
const GOT_PLT_INTRO_SIZE: usize = 0x18;

const MAX_HASH_BUCKETS: u32 = 32771;

const NEXT_INSTRUCTION_OFFSET: usize = 4;

// .plt stub pieces
const PUSH_REL: u16 = 0x35ff;
const JMP_REL: u16 = 0x25ff;
const JMP_32_BIT_OFFSET: u8 = 0xe9;
const PUSH_32_BITS: u8 = 0x68;
const NOP_32_BITS: u32 = 0x401f0f;
const NOP_8_BITS: u8 = 0x90;

// 0xDEADBEEF placeholders, patched before the file is written
const PLACEHOLDER_16: u16 = 0xadde;
const PLACEHOLDER_32: u32 = 0xefbeadde;
const PLACEHOLDER_64: u64 = 0xefbeadde_efbeadde;

fn elf32_st_info(bind: u8, ty: u8) -> u16 {
    u16::from((bind << 4) | (ty & 0xf))
}

fn elf64_r_info(sym: u64, ty: u32) -> u64 {
    (sym << 32) | u64::from(ty)
}

fn round_up(n: usize, multiple: usize) -> usize {
    debug_assert!(multiple.is_power_of_two());
    (n + multiple - 1) & !(multiple - 1)
}

#[derive(Default)]
struct SectionIndices {
    dynsym: usize,
    dynstr: usize,
    text: usize,
    dynamic: usize,
    got_plt: usize,
    data: usize,
    strtab: usize,
}

struct ElfWriter<'a> {
    code: &'a ObjectCode,
    entity: &'a Entity,
    out: Vec<u8>,

    // The unshuffled symbol list and its partition
    symbols: Vec<String>,
    data_symbols_size: usize,
    extern_data_symbols_size: usize,
    first_extern_data_symbol_index: usize,
    first_used_extern_fn_symbol_index: usize,

    // BFD shuffle
    shuffled_to_symbol: Vec<usize>,
    symbol_to_shuffled: Vec<usize>,

    // Per-symbol name offsets
    dynstr_name_offsets: Vec<usize>,
    strtab_name_offsets: Vec<usize>,

    // .data layout
    data_offsets: Vec<usize>,
    data_string_offsets: Vec<usize>,
    data_size: usize,
    resources_offset: usize,
    entities_offset: usize,
    entity_types_offset: usize,

    // .plt layout
    plt_fn_order: Vec<usize>,
    plt_fn_offsets: HashMap<String, usize>,

    // .got slots for the imported runtime globals
    got_slot_offsets: HashMap<&'static str, usize>,

    shindex: SectionIndices,

    text_size: usize,
    hash_offset: usize,
    hash_size: usize,
    dynsym_offset: usize,
    dynsym_placeholders_offset: usize,
    dynsym_size: usize,
    dynstr_offset: usize,
    dynstr_size: usize,
    rela_dyn_offset: usize,
    rela_dyn_size: usize,
    rela_plt_offset: usize,
    rela_plt_size: usize,
    plt_offset: usize,
    plt_size: usize,
    text_offset: usize,
    eh_frame_offset: usize,
    dynamic_offset: usize,
    dynamic_size: usize,
    got_offset: usize,
    got_size: usize,
    got_plt_offset: usize,
    got_plt_size: usize,
    data_offset: usize,
    segment_0_size: usize,
    symtab_offset: usize,
    symtab_size: usize,
    strtab_offset: usize,
    strtab_size: usize,
    shstrtab_offset: usize,
    shstrtab_size: usize,
    section_headers_offset: usize,

    symtab_index_first_global: usize,
    pltgot_value_offset: usize,

    // .shstrtab name offsets
    sh_name: HashMap<&'static str, usize>,
}

/// Assemble a compiled file into shared-object bytes.
pub fn write_shared_object(code: &ObjectCode, entity: &Entity) -> Result<Vec<u8>> {
    let mut writer = ElfWriter {
        code,
        entity,
        out: Vec::with_capacity(0x4000),
        symbols: Vec::new(),
        data_symbols_size: 0,
        extern_data_symbols_size: 0,
        first_extern_data_symbol_index: 0,
        first_used_extern_fn_symbol_index: 0,
        shuffled_to_symbol: Vec::new(),
        symbol_to_shuffled: Vec::new(),
        dynstr_name_offsets: Vec::new(),
        strtab_name_offsets: Vec::new(),
        data_offsets: Vec::new(),
        data_string_offsets: Vec::new(),
        data_size: 0,
        resources_offset: 0,
        entities_offset: 0,
        entity_types_offset: 0,
        plt_fn_order: Vec::new(),
        plt_fn_offsets: HashMap::new(),
        got_slot_offsets: HashMap::new(),
        shindex: SectionIndices::default(),
        text_size: code.code.len(),
        hash_offset: 0,
        hash_size: 0,
        dynsym_offset: 0,
        dynsym_placeholders_offset: 0,
        dynsym_size: 0,
        dynstr_offset: 0,
        dynstr_size: 0,
        rela_dyn_offset: 0,
        rela_dyn_size: 0,
        rela_plt_offset: 0,
        rela_plt_size: 0,
        plt_offset: 0,
        plt_size: 0,
        text_offset: 0,
        eh_frame_offset: 0,
        dynamic_offset: 0,
        dynamic_size: 0,
        got_offset: 0,
        got_size: 0,
        got_plt_offset: 0,
        got_plt_size: 0,
        data_offset: 0,
        segment_0_size: 0,
        symtab_offset: 0,
        symtab_size: 0,
        strtab_offset: 0,
        strtab_size: 0,
        shstrtab_offset: 0,
        shstrtab_size: 0,
        section_headers_offset: 0,
        symtab_index_first_global: 0,
        pltgot_value_offset: 0,
        sh_name: HashMap::new(),
    };
    writer.generate()?;
    Ok(writer.out)
}

impl<'a> ElfWriter<'a> {
    fn has_got(&self) -> bool {
        self.code.global_variables_count > 1 || !self.code.defined_on_fns.is_empty()
    }

    fn has_plt(&self) -> bool {
        !self.code.extern_fn_calls.is_empty()
    }

    fn has_rela_dyn(&self) -> bool {
        self.has_got()
            || !self.code.resources.is_empty()
            || !self.code.entity_dependencies.is_empty()
    }

    fn section_count(&self) -> usize {
        11 + 2 * usize::from(self.has_got())
            + usize::from(self.has_rela_dyn())
            + 2 * usize::from(self.has_plt())
    }

    /// Index of the defined on_ fn with this name, or None when the mod
    /// leaves the hook's slot null.
    fn defined_on_fn_index(&self, name: &str) -> Option<usize> {
        self.code.defined_on_fns.iter().position(|n| n == name)
    }

    // ---- Byte pushing ----

    fn push8(&mut self, byte: u8) {
        self.out.push(byte);
    }

    fn push_zeros(&mut self, count: usize) {
        self.out.extend(std::iter::repeat_n(0u8, count));
    }

    fn push16(&mut self, n: u16) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn push32(&mut self, n: u32) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn push64(&mut self, n: u64) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn push_c_string(&mut self, s: &str) {
        self.out.extend_from_slice(s.as_bytes());
        self.out.push(0);
    }

    fn push_alignment(&mut self, alignment: usize) {
        let excess = self.out.len() % alignment;
        if excess > 0 {
            self.push_zeros(alignment - excess);
        }
    }

    /// nasm pads with NOP instructions rather than zeros.
    fn push_nasm_alignment(&mut self, alignment: usize) {
        let excess = self.out.len() % alignment;
        if excess > 0 {
            for _ in 0..alignment - excess {
                self.push8(NOP_8_BITS);
            }
        }
    }

    fn overwrite(&mut self, mut n: u64, mut offset: usize, count: usize) {
        for _ in 0..count {
            self.out[offset] = (n & 0xff) as u8; // Little-endian
            offset += 1;
            n >>= 8;
        }
    }

    fn overwrite_16(&mut self, n: u64, offset: usize) {
        self.overwrite(n, offset, 2);
    }

    fn overwrite_32(&mut self, n: u64, offset: usize) {
        self.overwrite(n, offset, 4);
    }

    fn overwrite_64(&mut self, n: u64, offset: usize) {
        self.overwrite(n, offset, 8);
    }

    // ---- Symbol bookkeeping ----

    fn init_symbols(&mut self) {
        self.symbols.push(abi::export::GLOBALS_SIZE.to_string());
        self.data_symbols_size += 1;

        if !self.entity.on_functions.is_empty() {
            self.symbols.push(abi::export::ON_FNS.to_string());
            self.data_symbols_size += 1;
        }

        self.symbols.push(abi::export::RESOURCES_SIZE.to_string());
        self.data_symbols_size += 1;
        if !self.code.resources.is_empty() {
            self.symbols.push(abi::export::RESOURCES.to_string());
            self.data_symbols_size += 1;
        }

        self.symbols.push(abi::export::ENTITIES_SIZE.to_string());
        self.data_symbols_size += 1;
        if !self.code.entity_dependencies.is_empty() {
            self.symbols.push(abi::export::ENTITIES.to_string());
            self.data_symbols_size += 1;
            self.symbols.push(abi::export::ENTITY_TYPES.to_string());
            self.data_symbols_size += 1;
        }

        self.first_extern_data_symbol_index = self.data_symbols_size;
        if self.has_got() {
            // Pushed in the reverse of their .got slot order
            self.symbols.push(abi::global::FN_PATH.to_string());
            self.symbols.push(abi::global::FN_NAME.to_string());
            self.symbols.push(abi::global::HAS_RUNTIME_ERROR_HAPPENED.to_string());
            self.symbols.push(abi::global::ON_FNS_IN_SAFE_MODE.to_string());
            self.extern_data_symbols_size = 4;
        }

        self.first_used_extern_fn_symbol_index =
            self.first_extern_data_symbol_index + self.extern_data_symbols_size;
        for name in &self.code.used_extern_fns {
            self.symbols.push(name.clone());
        }

        // Text symbols, in emission order
        for name in &self.code.text_symbols {
            self.symbols.push(name.clone());
        }
    }

    fn init_shuffled_symbols(&mut self) {
        let names: Vec<&str> = self.symbols.iter().map(String::as_str).collect();
        self.shuffled_to_symbol = bfd_order(&names);
        self.symbol_to_shuffled = vec![0; self.symbols.len()];
        for (shuffled_index, &symbol_index) in self.shuffled_to_symbol.iter().enumerate() {
            self.symbol_to_shuffled[symbol_index] = shuffled_index;
        }
    }

    fn init_symbol_name_offsets(&mut self) {
        // .dynstr holds the names in unshuffled order, after its leading 0
        self.dynstr_name_offsets = Vec::with_capacity(self.symbols.len());
        let mut offset = 1;
        for symbol in &self.symbols {
            self.dynstr_name_offsets.push(offset);
            offset += symbol.len() + 1;
        }

        // .strtab holds them in shuffled order
        self.strtab_name_offsets = vec![0; self.symbols.len()];
        let mut offset = 0;
        for &symbol_index in &self.shuffled_to_symbol {
            self.strtab_name_offsets[symbol_index] = offset;
            offset += self.symbols[symbol_index].len() + 1;
        }
    }

    fn init_plt_order(&mut self) {
        let names: Vec<&str> = self.code.used_extern_fns.iter().map(String::as_str).collect();
        self.plt_fn_order = bfd_order(&names);
    }

    fn init_data_offsets(&mut self) {
        let mut offset = 0usize;

        // "globals_size"
        self.data_offsets.push(offset);
        offset += 8;

        // "on_fns" pointer table, one slot per declared hook
        if !self.entity.on_functions.is_empty() {
            self.data_offsets.push(offset);
            offset += 8 * self.entity.on_functions.len();
        }

        // Interned strings
        self.data_string_offsets = Vec::with_capacity(self.code.data_strings.len());
        for s in &self.code.data_strings {
            self.data_string_offsets.push(offset);
            offset += s.len() + 1;
        }

        // "resources_size", aligned
        offset = round_up(offset, 8);
        self.data_offsets.push(offset);
        offset += 8;

        // "resources"
        if !self.code.resources.is_empty() {
            self.data_offsets.push(offset);
            offset += 8 * self.code.resources.len();
        }

        // "entities_size"
        self.data_offsets.push(offset);
        offset += 8;

        if !self.code.entity_dependencies.is_empty() {
            // "entities"
            self.data_offsets.push(offset);
            offset += 8 * self.code.entity_dependencies.len();

            // "entity_types"
            self.data_offsets.push(offset);
            offset += 8 * self.code.entity_dependencies.len();
        }

        self.data_size = offset;
    }

    fn init_section_indices(&mut self) {
        let mut index = 1usize;
        index += 1; // .hash
        self.shindex.dynsym = index;
        index += 1;
        self.shindex.dynstr = index;
        index += 1;
        if self.has_rela_dyn() {
            index += 1; // .rela.dyn
        }
        if self.has_plt() {
            index += 2; // .rela.plt and .plt
        }
        self.shindex.text = index;
        index += 1;
        index += 1; // .eh_frame
        self.shindex.dynamic = index;
        index += 1;
        if self.has_got() {
            index += 1; // .got
            self.shindex.got_plt = index;
            index += 1;
        }
        self.shindex.data = index;
        index += 1;
        index += 1; // .symtab
        self.shindex.strtab = index;
    }

    fn get_symbol_offset(&self, symbol_index: usize) -> u32 {
        if symbol_index < self.data_symbols_size {
            return (self.data_offset + self.data_offsets[symbol_index]) as u32;
        }
        if symbol_index < self.first_extern_data_symbol_index + self.extern_data_symbols_size {
            return 0;
        }
        let extern_fns = self.code.used_extern_fns.len();
        if symbol_index < self.first_used_extern_fn_symbol_index + extern_fns {
            return 0;
        }
        let text_index =
            symbol_index - self.data_symbols_size - self.extern_data_symbols_size - extern_fns;
        (self.text_offset + self.code.text_offsets[text_index]) as u32
    }

    fn get_symbol_shndx(&self, symbol_index: usize) -> u16 {
        if symbol_index < self.data_symbols_size {
            return self.shindex.data as u16;
        }
        if symbol_index < self.first_extern_data_symbol_index + self.extern_data_symbols_size {
            return SHN_UNDEF;
        }
        let extern_fns = self.code.used_extern_fns.len();
        if symbol_index < self.first_used_extern_fn_symbol_index + extern_fns {
            return SHN_UNDEF;
        }
        self.shindex.text as u16
    }

    // ---- Section pushing ----

    fn push_elf_header(&mut self) {
        // Magic
        self.push8(0x7f);
        self.push8(b'E');
        self.push8(b'L');
        self.push8(b'F');

        self.push8(2); // 64-bit
        self.push8(1); // little-endian
        self.push8(1); // ELF version
        self.push8(0); // SysV OS ABI
        self.push_zeros(8);

        self.push8(ET_DYN);
        self.push8(0);
        self.push8(EM_X86_64);
        self.push8(0);

        self.push32(1); // original ELF version
        self.push_zeros(8); // no entry point
        self.push64(0x40); // program header table offset
        self.push64(PLACEHOLDER_64); // section header table offset, patched
        self.push_zeros(4); // processor flags
        self.push16(0x40); // ELF header size
        self.push16(0x38); // program header entry size
        self.push16(7); // program header count
        self.push16(0x40); // section header entry size
        self.push16(self.section_count() as u16);
        self.push16((self.section_count() - 1) as u16); // shstrtab index
    }

    fn push_program_header(
        &mut self,
        ty: u32,
        flags: u32,
        offset: u64,
        vaddr: u64,
        file_size: u64,
        mem_size: u64,
        alignment: u64,
    ) {
        self.push32(ty);
        self.push32(flags);
        self.push64(offset);
        self.push64(vaddr);
        self.push64(vaddr); // physical address mirrors the virtual one
        self.push64(file_size);
        self.push64(mem_size);
        self.push64(alignment);
    }

    fn push_program_headers(&mut self) {
        let p = u64::from(PLACEHOLDER_32);

        // 0: .hash .. .rela.plt, R
        self.push_program_header(PT_LOAD, PF_R, 0, 0, p, p, 0x1000);
        // 1: .plt + .text, RX
        self.push_program_header(PT_LOAD, PF_R | PF_X, p, p, p, p, 0x1000);
        // 2: .eh_frame (empty), R
        self.push_program_header(PT_LOAD, PF_R, p, p, 0, 0, 0x1000);
        // 3: .dynamic + .got + .got.plt + .data, RW
        self.push_program_header(PT_LOAD, PF_R | PF_W, p, p, p, p, 0x1000);
        // 4: PT_DYNAMIC
        self.push_program_header(PT_DYNAMIC, PF_R | PF_W, p, p, p, p, 8);
        // 5: PT_GNU_STACK, empty; needed since the glibc 2.41 behavior
        // change around executable stacks
        self.push_program_header(PT_GNU_STACK, PF_R | PF_W, 0, 0, 0, 0, 0x10);
        // 6: PT_GNU_RELRO over .dynamic + .got
        self.push_program_header(PT_GNU_RELRO, PF_R, p, p, p, p, 1);
    }

    fn get_nbucket(&self) -> u32 {
        // From ld: fewer than 3 symbols uses 1 bucket, fewer than 17 uses
        // 3, fewer than 37 uses 17, and so forth
        const NBUCKET_OPTIONS: [u32; 16] = [
            1, 3, 17, 37, 67, 97, 131, 197, 263, 521, 1031, 2053, 4099, 8209, 16411,
            MAX_HASH_BUCKETS,
        ];

        let symbol_count = self.symbols.len() as u32;
        let mut nbucket = NBUCKET_OPTIONS[0];
        for (i, &option) in NBUCKET_OPTIONS.iter().enumerate() {
            nbucket = option;
            match NBUCKET_OPTIONS.get(i + 1) {
                Some(&next) if symbol_count < next => break,
                Some(_) => {}
                None => break,
            }
        }
        nbucket
    }

    fn push_hash(&mut self) {
        self.hash_offset = self.out.len();

        let nbucket = self.get_nbucket();
        self.push32(nbucket);

        let nchain = 1 + self.symbols.len() as u32; // index 0 is STN_UNDEF
        self.push32(nchain);

        let mut buckets = vec![0u32; nbucket as usize];
        let mut chains = Vec::with_capacity(self.symbols.len() + 1);
        chains.push(0u32); // STN_UNDEF

        for &symbol_index in &self.shuffled_to_symbol {
            let name = &self.symbols[symbol_index];
            let bucket_index = (elf_hash(name) % nbucket) as usize;
            chains.push(buckets[bucket_index]);
            buckets[bucket_index] = (chains.len() - 1) as u32;
        }

        for bucket in buckets {
            self.push32(bucket);
        }
        for chain in chains {
            self.push32(chain);
        }

        self.hash_size = self.out.len() - self.hash_offset;
        self.push_alignment(8);
    }

    fn push_symbol_entry(&mut self, name: u32, info: u16, shndx: u16, offset: u32) {
        self.push32(name);
        self.push16(info);
        self.push16(shndx);
        self.push32(offset);
        self.push_zeros(SYMTAB_ENTRY_SIZE - 4 - 2 - 2 - 4);
    }

    fn push_dynsym(&mut self) {
        self.dynsym_offset = self.out.len();

        // Null entry
        self.push_symbol_entry(0, elf32_st_info(STB_LOCAL, STT_NOTYPE), SHN_UNDEF, 0);

        self.dynsym_placeholders_offset = self.out.len();
        for _ in 0..self.symbols.len() {
            self.push_symbol_entry(
                PLACEHOLDER_32,
                PLACEHOLDER_16,
                PLACEHOLDER_16,
                PLACEHOLDER_32,
            );
        }

        self.dynsym_size = self.out.len() - self.dynsym_offset;
    }

    fn push_dynstr(&mut self) {
        self.dynstr_offset = self.out.len();
        self.push8(0);
        let symbols = std::mem::take(&mut self.symbols);
        for symbol in &symbols {
            self.push_c_string(symbol);
        }
        self.symbols = symbols;
        self.dynstr_size = self.out.len() - self.dynstr_offset;
    }

    fn push_rela(&mut self, offset: u64, info: u64, addend: u64) {
        self.push64(offset);
        self.push64(info);
        self.push64(addend);
    }

    fn push_rela_dyn(&mut self) {
        let entity = self.entity;
        for declared in &entity.on_functions {
            if self.defined_on_fn_index(&declared.name).is_some() {
                self.push_rela(PLACEHOLDER_64, elf64_r_info(0, R_X86_64_RELATIVE), PLACEHOLDER_64);
            }
        }

        for _ in 0..self.code.resources.len() {
            self.push_rela(PLACEHOLDER_64, elf64_r_info(0, R_X86_64_RELATIVE), PLACEHOLDER_64);
        }

        // "entities", then the parallel "entity_types"
        for _ in 0..2 * self.code.entity_dependencies.len() {
            self.push_rela(PLACEHOLDER_64, elf64_r_info(0, R_X86_64_RELATIVE), PLACEHOLDER_64);
        }

        // GLOB_DAT entries for the imported globals, in reverse push order
        for i in (0..self.extern_data_symbols_size).rev() {
            let symbol_index = self.first_extern_data_symbol_index + i;
            // `1 +` skips the null symbol
            let dynsym_index = 1 + self.symbol_to_shuffled[symbol_index];
            self.push_rela(
                PLACEHOLDER_64,
                elf64_r_info(dynsym_index as u64, R_X86_64_GLOB_DAT),
                PLACEHOLDER_64,
            );
        }

        self.rela_dyn_size = self.out.len() - self.rela_dyn_offset;
    }

    fn push_rela_plt(&mut self) {
        self.rela_plt_offset = self.out.len();

        let extern_fns = self.code.used_extern_fns.len();
        for shuffled_index in 0..self.symbols.len() {
            let symbol_index = self.shuffled_to_symbol[shuffled_index];
            if symbol_index < self.first_used_extern_fn_symbol_index
                || symbol_index >= self.first_used_extern_fn_symbol_index + extern_fns
            {
                continue;
            }

            let dynsym_index = 1 + shuffled_index;
            self.push_rela(
                PLACEHOLDER_64,
                elf64_r_info(dynsym_index as u64, R_X86_64_JUMP_SLOT),
                0,
            );
        }

        self.rela_plt_size = self.out.len() - self.rela_plt_offset;
    }

    fn push_plt(&mut self) {
        // Header entry: push the module id slot, jump through the resolver
        // slot; see https://stackoverflow.com/q/76987336/13279557
        self.push16(PUSH_REL);
        self.push32(PLACEHOLDER_32);
        self.push16(JMP_REL);
        self.push32(PLACEHOLDER_32);
        self.push32(NOP_32_BITS);

        let code = self.code;
        let mut offset = 0x10usize;
        let order = self.plt_fn_order.clone();
        for (reloc_index, &fn_index) in order.iter().enumerate() {
            let name = &code.used_extern_fns[fn_index];

            self.push16(JMP_REL);
            self.push32(PLACEHOLDER_32);
            self.push8(PUSH_32_BITS);
            self.push32(reloc_index as u32);
            self.push8(JMP_32_BIT_OFFSET);
            self.plt_fn_offsets.insert(name.clone(), offset);
            let offset_to_start_of_plt = -(offset as i64) - 0x10;
            self.push32(offset_to_start_of_plt as u32);
            offset += 0x10;
        }

        self.plt_size = self.out.len() - self.plt_offset;
    }

    fn push_text(&mut self) {
        self.text_offset = self.out.len();
        self.out.extend_from_slice(&self.code.code);
        self.push_alignment(8);
    }

    fn push_dynamic_entry(&mut self, tag: u64, value: u64) {
        self.push64(tag);
        self.push64(value);
    }

    fn push_dynamic(&mut self) {
        let entry_size = 0x10usize;
        self.dynamic_size = 11 * entry_size;
        if self.has_plt() {
            self.dynamic_size += 4 * entry_size;
        }
        if self.has_rela_dyn() {
            self.dynamic_size += 3 * entry_size;
        }

        // Place .dynamic so that .dynamic + .got + the reserved .got.plt
        // intro end exactly at the next page boundary, like modern ld
        let segment_2_to_3_offset = 0x1000;
        let mut dynamic_offset = self.out.len() + segment_2_to_3_offset - self.dynamic_size;
        if self.has_got() {
            dynamic_offset -= 8 * 4; // the four imported runtime globals
            dynamic_offset -= GOT_PLT_INTRO_SIZE;
        }
        self.dynamic_offset = dynamic_offset;

        let gap = dynamic_offset - self.out.len();
        self.push_zeros(gap);

        self.push_dynamic_entry(DT_HASH, self.hash_offset as u64);
        self.push_dynamic_entry(DT_STRTAB, self.dynstr_offset as u64);
        self.push_dynamic_entry(DT_SYMTAB, self.dynsym_offset as u64);
        self.push_dynamic_entry(DT_STRSZ, self.dynstr_size as u64);
        self.push_dynamic_entry(DT_SYMENT, SYMTAB_ENTRY_SIZE as u64);

        if self.has_plt() {
            self.push64(DT_PLTGOT);
            self.pltgot_value_offset = self.out.len();
            self.push64(PLACEHOLDER_64);

            self.push_dynamic_entry(
                DT_PLTRELSZ,
                (PLT_ENTRY_SIZE * self.code.used_extern_fns.len()) as u64,
            );
            self.push_dynamic_entry(DT_PLTREL, DT_RELA);
            self.push_dynamic_entry(DT_JMPREL, self.rela_plt_offset as u64);
        }

        if self.has_rela_dyn() {
            let relative_count = self.code.defined_on_fns.len()
                + self.code.resources.len()
                + 2 * self.code.entity_dependencies.len();

            self.push_dynamic_entry(DT_RELA, self.rela_dyn_offset as u64);
            self.push_dynamic_entry(
                DT_RELASZ,
                ((relative_count + self.extern_data_symbols_size) * RELA_ENTRY_SIZE) as u64,
            );
            self.push_dynamic_entry(DT_RELAENT, RELA_ENTRY_SIZE as u64);

            if relative_count > 0 {
                self.push_dynamic_entry(DT_RELACOUNT, relative_count as u64);
            }
        }

        // Marks the end of the _DYNAMIC array
        self.push_dynamic_entry(DT_NULL, 0);

        // ld reserves room for five more entries, one fewer when any
        // relative relocations exist
        let mut padding = 5 * entry_size;
        let relative_sources = usize::from(!self.code.resources.is_empty())
            + usize::from(!self.code.entity_dependencies.is_empty())
            + usize::from(!self.code.defined_on_fns.is_empty());
        if relative_sources > 0 {
            padding -= entry_size;
        }
        self.push_zeros(padding);
    }

    fn push_got(&mut self) {
        self.got_offset = self.out.len();

        let mut offset = 0usize;
        for name in [
            abi::global::ON_FNS_IN_SAFE_MODE,
            abi::global::HAS_RUNTIME_ERROR_HAPPENED,
            abi::global::FN_NAME,
            abi::global::FN_PATH,
        ] {
            self.got_slot_offsets.insert(name, offset);
            offset += 8;
            self.push_zeros(8);
        }

        self.got_size = self.out.len() - self.got_offset;
    }

    fn push_got_plt(&mut self) {
        self.got_plt_offset = self.out.len();

        self.push64(self.dynamic_offset as u64);
        self.push_zeros(8); // dynamic linker module id, filled at load time
        self.push_zeros(8); // dynamic linker resolver, filled at load time

        // One slot per import, initially pointing at the stub's push
        // instruction (0x6 into each 0x10-byte entry)
        let entry_size = 0x10usize;
        let mut offset = self.plt_offset + entry_size + 0x6;
        for _ in 0..self.code.used_extern_fns.len() {
            self.push64(offset as u64);
            offset += entry_size;
        }

        self.got_plt_size = self.out.len() - self.got_plt_offset;
    }

    fn push_data(&mut self) -> Result<()> {
        self.data_offset = self.out.len();

        // "globals_size"
        self.push64(self.code.globals_bytes as u64);

        // "on_fns" table: a slot per declared hook, in declaration order
        let mut previous_on_fn_index = 0usize;
        let entity = self.entity;
        for declared in &entity.on_functions {
            match self.defined_on_fn_index(&declared.name) {
                Some(on_fn_index) => {
                    ensure!(
                        previous_on_fn_index <= on_fn_index,
                        "The function '{}' needs to be moved before/after a different on_ function, according to the entity '{}' in mod_api.json",
                        declared.name,
                        self.entity.name
                    );
                    previous_on_fn_index = on_fn_index;

                    let fns_before_on_fns = 1; // just init_globals()
                    let value = self.text_offset
                        + self.code.text_offsets[on_fn_index + fns_before_on_fns];
                    self.push64(value as u64);
                }
                None => self.push64(0),
            }
        }

        // Interned strings
        let code = self.code;
        for s in &code.data_strings {
            self.push_c_string(s);
        }

        // "resources_size"
        self.push_nasm_alignment(8);
        self.push64(self.code.resources.len() as u64);

        // "resources"
        self.resources_offset = self.out.len();
        for &string_index in &code.resources {
            let value = self.data_offset + self.data_string_offsets[string_index as usize];
            self.push64(value as u64);
        }

        // "entities_size"
        self.push64(self.code.entity_dependencies.len() as u64);

        // "entities"
        self.entities_offset = self.out.len();
        for &string_index in &code.entity_dependencies {
            let value = self.data_offset + self.data_string_offsets[string_index as usize];
            self.push64(value as u64);
        }

        // "entity_types"
        self.entity_types_offset = self.out.len();
        for &string_index in &code.entity_types {
            let value = self.data_offset + self.data_string_offsets[string_index as usize];
            self.push64(value as u64);
        }

        self.push_alignment(8);
        Ok(())
    }

    fn push_symtab(&mut self) {
        self.symtab_offset = self.out.len();

        let mut pushed_symbol_entries = 0usize;

        // Null entry
        self.push_symbol_entry(0, elf32_st_info(STB_LOCAL, STT_NOTYPE), SHN_UNDEF, 0);
        pushed_symbol_entries += 1;

        // The `1 +` skips the 0 byte .strtab always starts with
        let mut name_offset = 1usize;

        self.push_symbol_entry(
            name_offset as u32,
            elf32_st_info(STB_LOCAL, STT_OBJECT),
            self.shindex.dynamic as u16,
            self.dynamic_offset as u32,
        );
        pushed_symbol_entries += 1;
        name_offset += "_DYNAMIC".len() + 1;

        if self.has_got() {
            self.push_symbol_entry(
                name_offset as u32,
                elf32_st_info(STB_LOCAL, STT_OBJECT),
                self.shindex.got_plt as u16,
                self.got_plt_offset as u32,
            );
            pushed_symbol_entries += 1;
            name_offset += "_GLOBAL_OFFSET_TABLE_".len() + 1;
        }

        self.symtab_index_first_global = pushed_symbol_entries;

        for i in 0..self.symbols.len() {
            let symbol_index = self.shuffled_to_symbol[i];
            self.push_symbol_entry(
                (name_offset + self.strtab_name_offsets[symbol_index]) as u32,
                elf32_st_info(STB_GLOBAL, STT_NOTYPE),
                self.get_symbol_shndx(symbol_index),
                self.get_symbol_offset(symbol_index),
            );
        }

        self.symtab_size = self.out.len() - self.symtab_offset;
    }

    fn push_strtab(&mut self) {
        self.strtab_offset = self.out.len();

        self.push8(0);
        self.push_c_string("_DYNAMIC");
        if self.has_got() {
            self.push_c_string("_GLOBAL_OFFSET_TABLE_");
        }

        let order = self.shuffled_to_symbol.clone();
        for symbol_index in order {
            let name = self.symbols[symbol_index].clone();
            self.push_c_string(&name);
        }

        self.strtab_size = self.out.len() - self.strtab_offset;
    }

    fn push_sh_name(&mut self, text: &'static str) {
        let offset = self.out.len() - self.shstrtab_offset;
        self.sh_name.insert(text, offset);
        self.push_c_string(text);
    }

    fn push_shstrtab(&mut self) {
        self.shstrtab_offset = self.out.len();

        self.push8(0);

        self.push_sh_name(".symtab");
        self.push_sh_name(".strtab");
        self.push_sh_name(".shstrtab");
        self.push_sh_name(".hash");
        self.push_sh_name(".dynsym");
        self.push_sh_name(".dynstr");

        if self.has_rela_dyn() {
            self.push_sh_name(".rela.dyn");
        }
        if self.has_plt() {
            // ".plt" reuses the tail of ".rela.plt"
            let offset = self.out.len() - self.shstrtab_offset;
            self.sh_name.insert(".rela.plt", offset);
            self.sh_name.insert(".plt", offset + ".rela".len());
            self.push_c_string(".rela.plt");
        }

        self.push_sh_name(".text");
        self.push_sh_name(".eh_frame");
        self.push_sh_name(".dynamic");
        if self.has_got() {
            self.push_sh_name(".got");
            self.push_sh_name(".got.plt");
        }
        self.push_sh_name(".data");

        self.shstrtab_size = self.out.len() - self.shstrtab_offset;
        self.push_alignment(8);
    }

    #[allow(clippy::too_many_arguments)]
    fn push_section_header(
        &mut self,
        name_offset: usize,
        ty: u32,
        flags: u64,
        address: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        alignment: u64,
        entry_size: u64,
    ) {
        self.push32(name_offset as u32);
        self.push32(ty);
        self.push64(flags);
        self.push64(address);
        self.push64(offset);
        self.push64(size);
        self.push32(link);
        self.push32(info);
        self.push64(alignment);
        self.push64(entry_size);
    }

    fn push_section_headers(&mut self) {
        self.section_headers_offset = self.out.len();

        // Null section
        self.push_zeros(0x40);

        self.push_section_header(
            self.sh_name[".hash"],
            SHT_HASH,
            SHF_ALLOC,
            self.hash_offset as u64,
            self.hash_offset as u64,
            self.hash_size as u64,
            self.shindex.dynsym as u32,
            0,
            8,
            4,
        );

        self.push_section_header(
            self.sh_name[".dynsym"],
            SHT_DYNSYM,
            SHF_ALLOC,
            self.dynsym_offset as u64,
            self.dynsym_offset as u64,
            self.dynsym_size as u64,
            self.shindex.dynstr as u32,
            1,
            8,
            24,
        );

        self.push_section_header(
            self.sh_name[".dynstr"],
            SHT_STRTAB,
            SHF_ALLOC,
            self.dynstr_offset as u64,
            self.dynstr_offset as u64,
            self.dynstr_size as u64,
            u32::from(SHN_UNDEF),
            0,
            1,
            0,
        );

        if self.has_rela_dyn() {
            self.push_section_header(
                self.sh_name[".rela.dyn"],
                SHT_RELA,
                SHF_ALLOC,
                self.rela_dyn_offset as u64,
                self.rela_dyn_offset as u64,
                self.rela_dyn_size as u64,
                self.shindex.dynsym as u32,
                0,
                8,
                24,
            );
        }

        if self.has_plt() {
            self.push_section_header(
                self.sh_name[".rela.plt"],
                SHT_RELA,
                SHF_ALLOC | SHF_INFO_LINK,
                self.rela_plt_offset as u64,
                self.rela_plt_offset as u64,
                self.rela_plt_size as u64,
                self.shindex.dynsym as u32,
                self.shindex.got_plt as u32,
                8,
                24,
            );

            self.push_section_header(
                self.sh_name[".plt"],
                SHT_PROGBITS,
                SHF_ALLOC | SHF_EXECINSTR,
                self.plt_offset as u64,
                self.plt_offset as u64,
                self.plt_size as u64,
                u32::from(SHN_UNDEF),
                0,
                16,
                16,
            );
        }

        self.push_section_header(
            self.sh_name[".text"],
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            self.text_offset as u64,
            self.text_offset as u64,
            self.text_size as u64,
            u32::from(SHN_UNDEF),
            0,
            16,
            0,
        );

        self.push_section_header(
            self.sh_name[".eh_frame"],
            SHT_PROGBITS,
            SHF_ALLOC,
            self.eh_frame_offset as u64,
            self.eh_frame_offset as u64,
            0,
            u32::from(SHN_UNDEF),
            0,
            8,
            0,
        );

        self.push_section_header(
            self.sh_name[".dynamic"],
            SHT_DYNAMIC,
            SHF_WRITE | SHF_ALLOC,
            self.dynamic_offset as u64,
            self.dynamic_offset as u64,
            self.dynamic_size as u64,
            self.shindex.dynstr as u32,
            0,
            8,
            16,
        );

        if self.has_got() {
            self.push_section_header(
                self.sh_name[".got"],
                SHT_PROGBITS,
                SHF_WRITE | SHF_ALLOC,
                self.got_offset as u64,
                self.got_offset as u64,
                self.got_size as u64,
                u32::from(SHN_UNDEF),
                0,
                8,
                8,
            );

            self.push_section_header(
                self.sh_name[".got.plt"],
                SHT_PROGBITS,
                SHF_WRITE | SHF_ALLOC,
                self.got_plt_offset as u64,
                self.got_plt_offset as u64,
                self.got_plt_size as u64,
                u32::from(SHN_UNDEF),
                0,
                8,
                8,
            );
        }

        self.push_section_header(
            self.sh_name[".data"],
            SHT_PROGBITS,
            SHF_WRITE | SHF_ALLOC,
            self.data_offset as u64,
            self.data_offset as u64,
            self.data_size as u64,
            u32::from(SHN_UNDEF),
            0,
            8,
            0,
        );

        // .symtab's "link" is the section index of its string table, and
        // its "info" the index of the first non-local symbol
        self.push_section_header(
            self.sh_name[".symtab"],
            SHT_SYMTAB,
            0,
            0,
            self.symtab_offset as u64,
            self.symtab_size as u64,
            self.shindex.strtab as u32,
            self.symtab_index_first_global as u32,
            8,
            SYMTAB_ENTRY_SIZE as u64,
        );

        self.push_section_header(
            self.sh_name[".strtab"],
            SHT_STRTAB,
            0,
            0,
            self.strtab_offset as u64,
            self.strtab_size as u64,
            u32::from(SHN_UNDEF),
            0,
            1,
            0,
        );

        self.push_section_header(
            self.sh_name[".shstrtab"],
            SHT_STRTAB,
            0,
            0,
            self.shstrtab_offset as u64,
            self.shstrtab_size as u64,
            u32::from(SHN_UNDEF),
            0,
            1,
            0,
        );
    }

    fn push_bytes(&mut self) -> Result<()> {
        self.push_elf_header();
        self.push_program_headers();
        self.push_hash();
        self.push_dynsym();
        self.push_dynstr();

        if self.has_rela_dyn() {
            self.push_alignment(8);
        }
        self.rela_dyn_offset = self.out.len();
        if self.has_rela_dyn() {
            self.push_rela_dyn();
        }

        if self.has_plt() {
            self.push_rela_plt();
        }

        self.segment_0_size = self.out.len();

        let next_segment_offset = round_up(self.out.len(), 0x1000);
        let gap = next_segment_offset - self.out.len();
        self.push_zeros(gap);

        self.plt_offset = self.out.len();
        if self.has_plt() {
            self.push_plt();
        }

        self.push_text();

        self.eh_frame_offset = round_up(self.out.len(), 0x1000);
        let gap = self.eh_frame_offset - self.out.len();
        self.push_zeros(gap);

        self.push_dynamic();

        if self.has_got() {
            self.push_got();
            self.push_got_plt();
        }

        self.push_data()?;
        self.push_symtab();
        self.push_strtab();
        self.push_shstrtab();
        self.push_section_headers();
        Ok(())
    }

    // ---- Patching ----

    fn patch_program_headers(&mut self) {
        // 0: .hash .. .rela.plt
        self.overwrite_64(self.segment_0_size as u64, 0x60); // file size
        self.overwrite_64(self.segment_0_size as u64, 0x68); // mem size

        // 1: .plt + .text
        self.overwrite_64(self.plt_offset as u64, 0x80);
        self.overwrite_64(self.plt_offset as u64, 0x88);
        self.overwrite_64(self.plt_offset as u64, 0x90);
        let mut size = self.text_size;
        if self.has_plt() {
            size += self.plt_size;
        }
        self.overwrite_64(size as u64, 0x98);
        self.overwrite_64(size as u64, 0xa0);

        // 2: .eh_frame
        self.overwrite_64(self.eh_frame_offset as u64, 0xb8);
        self.overwrite_64(self.eh_frame_offset as u64, 0xc0);
        self.overwrite_64(self.eh_frame_offset as u64, 0xc8);

        // 3: .dynamic + .got + .got.plt + .data
        self.overwrite_64(self.dynamic_offset as u64, 0xf0);
        self.overwrite_64(self.dynamic_offset as u64, 0xf8);
        self.overwrite_64(self.dynamic_offset as u64, 0x100);
        let mut size = self.dynamic_size + self.data_size;
        if self.has_got() {
            size += self.got_size + self.got_plt_size;
        }
        self.overwrite_64(size as u64, 0x108);
        self.overwrite_64(size as u64, 0x110);

        // 4: PT_DYNAMIC
        self.overwrite_64(self.dynamic_offset as u64, 0x128);
        self.overwrite_64(self.dynamic_offset as u64, 0x130);
        self.overwrite_64(self.dynamic_offset as u64, 0x138);
        self.overwrite_64(self.dynamic_size as u64, 0x140);
        self.overwrite_64(self.dynamic_size as u64, 0x148);

        // 5 is the empty PT_GNU_STACK

        // 6: PT_GNU_RELRO over .dynamic + .got + the .got.plt intro
        self.overwrite_64(self.dynamic_offset as u64, 0x198);
        self.overwrite_64(self.dynamic_offset as u64, 0x1a0);
        self.overwrite_64(self.dynamic_offset as u64, 0x1a8);
        let mut segment_5_size = self.dynamic_size;
        if self.has_got() {
            segment_5_size += self.got_size + GOT_PLT_INTRO_SIZE;
        }
        self.overwrite_64(segment_5_size as u64, 0x1b0);
        self.overwrite_64(segment_5_size as u64, 0x1b8);
    }

    fn patch_dynsym(&mut self) {
        let mut offset = self.dynsym_placeholders_offset;
        for i in 0..self.symbols.len() {
            let symbol_index = self.shuffled_to_symbol[i];

            self.overwrite_32(self.dynstr_name_offsets[symbol_index] as u64, offset);
            offset += 4;
            self.overwrite_16(u64::from(elf32_st_info(STB_GLOBAL, STT_NOTYPE)), offset);
            offset += 2;
            self.overwrite_16(u64::from(self.get_symbol_shndx(symbol_index)), offset);
            offset += 2;
            self.overwrite_32(u64::from(self.get_symbol_offset(symbol_index)), offset);
            offset += 4;

            offset += SYMTAB_ENTRY_SIZE - 4 - 2 - 2 - 4;
        }
    }

    fn patch_rela_dyn(&mut self) {
        let mut bytes_offset = self.rela_dyn_offset;

        // on_fns slots start right after the 8-byte globals_size
        let mut on_fn_data_offset = 8usize;
        let entity = self.entity;
        for declared in &entity.on_functions {
            if let Some(on_fn_index) = self.defined_on_fn_index(&declared.name) {
                self.overwrite_64(
                    (self.data_offset + on_fn_data_offset) as u64,
                    bytes_offset,
                );
                bytes_offset += 16;

                let fns_before_on_fns = 1; // just init_globals()
                let addend = self.text_offset
                    + self.code.text_offsets[on_fn_index + fns_before_on_fns];
                self.overwrite_64(addend as u64, bytes_offset);
                bytes_offset += 8;
            }
            on_fn_data_offset += 8;
        }

        for i in 0..self.code.resources.len() {
            self.overwrite_64((self.resources_offset + i * 8) as u64, bytes_offset);
            bytes_offset += 16;
            let string_index = self.code.resources[i] as usize;
            let addend = self.data_offset + self.data_string_offsets[string_index];
            self.overwrite_64(addend as u64, bytes_offset);
            bytes_offset += 8;
        }

        for i in 0..self.code.entity_dependencies.len() {
            self.overwrite_64((self.entities_offset + i * 8) as u64, bytes_offset);
            bytes_offset += 16;
            let string_index = self.code.entity_dependencies[i] as usize;
            let addend = self.data_offset + self.data_string_offsets[string_index];
            self.overwrite_64(addend as u64, bytes_offset);
            bytes_offset += 8;
        }

        for i in 0..self.code.entity_types.len() {
            self.overwrite_64((self.entity_types_offset + i * 8) as u64, bytes_offset);
            bytes_offset += 16;
            let string_index = self.code.entity_types[i] as usize;
            let addend = self.data_offset + self.data_string_offsets[string_index];
            self.overwrite_64(addend as u64, bytes_offset);
            bytes_offset += 8;
        }

        for i in 0..self.extern_data_symbols_size {
            self.overwrite_64((self.got_offset + i * 8) as u64, bytes_offset);
            bytes_offset += 16;
            self.overwrite_64(0, bytes_offset);
            bytes_offset += 8;
        }
    }

    fn patch_rela_plt(&mut self) {
        let mut value_offset = self.got_plt_offset + GOT_PLT_INTRO_SIZE;
        let mut address_offset = self.rela_plt_offset;

        let extern_fns = self.code.used_extern_fns.len();
        for shuffled_index in 0..self.symbols.len() {
            let symbol_index = self.shuffled_to_symbol[shuffled_index];
            if symbol_index < self.first_used_extern_fn_symbol_index
                || symbol_index >= self.first_used_extern_fn_symbol_index + extern_fns
            {
                continue;
            }

            self.overwrite_64(value_offset as u64, address_offset);
            value_offset += 8;
            address_offset += RELA_ENTRY_SIZE;
        }
    }

    fn patch_plt(&mut self) {
        let mut overwritten_address = self.plt_offset;
        let address_size = 4usize;

        // Header: push the module id slot, jump through the resolver slot
        overwritten_address += 2;
        self.overwrite_32(
            (self.got_plt_offset - overwritten_address - address_size + 0x8) as u64,
            overwritten_address,
        );
        overwritten_address += address_size + 2;
        self.overwrite_32(
            (self.got_plt_offset - overwritten_address - address_size + 0x10) as u64,
            overwritten_address,
        );

        // Each stub's first jmp goes through its .got.plt slot
        let mut got_plt_fn_address = self.got_plt_offset + GOT_PLT_INTRO_SIZE;
        overwritten_address += 2 * 4 + 2;

        for _ in 0..self.plt_fn_order.len() {
            self.overwrite_32(
                (got_plt_fn_address - overwritten_address - NEXT_INSTRUCTION_OFFSET) as u64,
                overwritten_address,
            );
            got_plt_fn_address += 8;
            // jmp rel32, push imm32, jmp rel32
            overwritten_address += 4 + 1 + 4 + 1 + 4 + 2;
        }
    }

    fn patch_text(&mut self) -> Result<()> {
        let code = self.code;

        // Extern calls bounce through their PLT stub
        for reloc in &code.extern_fn_calls {
            let offset = self.text_offset + reloc.offset;
            let after_call = offset + NEXT_INSTRUCTION_OFFSET;
            let Some(&plt_fn_offset) = self.plt_fn_offsets.get(&reloc.name) else {
                bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
            };
            let target = self.plt_offset + plt_fn_offset;
            self.overwrite_32((target as i64 - after_call as i64) as u64 & 0xffff_ffff, offset);
        }

        // Helper calls stay inside .text
        for reloc in &code.helper_fn_calls {
            let offset = self.text_offset + reloc.offset;
            let after_call = offset + NEXT_INSTRUCTION_OFFSET;
            let Some(&helper_offset) = code.helper_fn_offsets.get(&reloc.name) else {
                bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
            };
            let target = self.text_offset + helper_offset;
            self.overwrite_32((target as i64 - after_call as i64) as u64 & 0xffff_ffff, offset);
        }

        // RIP-relative string LEAs
        for &(string_index, code_offset) in &code.data_string_relocs {
            let string_address =
                self.data_offset + self.data_string_offsets[string_index as usize];
            let next_instruction = self.text_offset + code_offset + NEXT_INSTRUCTION_OFFSET;
            self.overwrite_32(
                (string_address as i64 - next_instruction as i64) as u64 & 0xffff_ffff,
                self.text_offset + code_offset,
            );
        }

        // GOT loads of the imported runtime globals
        for reloc in &code.used_extern_globals {
            let offset = self.text_offset + reloc.offset;
            let after_instruction = offset + NEXT_INSTRUCTION_OFFSET;
            let Some(&slot) = self.got_slot_offsets.get(reloc.name.as_str()) else {
                bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
            };
            let target = self.got_offset + slot;
            self.overwrite_32(
                (target as i64 - after_instruction as i64) as u64 & 0xffff_ffff,
                offset,
            );
        }
        Ok(())
    }

    fn patch_bytes(&mut self) -> Result<()> {
        // Section header table offset in the ELF header
        self.overwrite_64(self.section_headers_offset as u64, 0x28);

        self.patch_program_headers();
        self.patch_dynsym();
        if self.has_rela_dyn() {
            self.patch_rela_dyn();
        }
        if self.has_plt() {
            self.patch_rela_plt();
            self.patch_plt();
        }
        self.patch_text()?;

        if self.has_plt() {
            let offset = self.pltgot_value_offset;
            self.overwrite_64(self.got_plt_offset as u64, offset);
        }
        Ok(())
    }

    fn generate(&mut self) -> Result<()> {
        self.init_section_indices();
        self.init_symbols();
        self.init_shuffled_symbols();
        self.init_symbol_name_offsets();
        self.init_plt_order();
        self.init_data_offsets();

        self.push_bytes()?;
        self.patch_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen;
    use crate::json::parse_json;
    use crate::modapi::ModApi;
    use crate::parser::parse;
    use crate::typeck::fill_result_types;

    fn test_api() -> ModApi {
        ModApi::from_tree(
            &parse_json(
                r#"{
                    "entities": {
                        "Greeter": {
                            "description": "says hi",
                            "on_functions": {
                                "on_spawn": {"description": "first"},
                                "on_start": {"description": "second"}
                            }
                        }
                    },
                    "game_functions": {
                        "play": {
                            "description": "play a sound",
                            "arguments": [
                                {"name": "path", "type": "resource", "resource_extension": ".wav"}
                            ]
                        },
                        "noop": {"description": "does nothing"}
                    }
                }"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn build(source: &str) -> (Vec<u8>, ObjectCode) {
        let api = test_api();
        let mut ast = parse(source).unwrap();
        let globals = fill_result_types(&mut ast, &api, "guns", "Greeter").unwrap();
        let code = codegen::compile(
            &ast,
            &api,
            &globals,
            "mods/guns/hello-Greeter.grug",
            "guns",
            "mods",
        )
        .unwrap();
        let entity = api.entity("Greeter").unwrap();
        let bytes = write_shared_object(&code, entity).unwrap();
        (bytes, code)
    }

    fn read_u16(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    fn read_u64(bytes: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn test_elf_header_identity() {
        let (bytes, _) = build("on_start() {\n    noop()\n}\n");
        assert_eq!(&bytes[..4], b"\x7fELF");
        assert_eq!(bytes[4], 2); // 64-bit
        assert_eq!(bytes[5], 1); // little-endian
        assert_eq!(bytes[0x10], 3); // ET_DYN
        assert_eq!(bytes[0x12], 0x3e); // x86-64
        assert_eq!(read_u16(&bytes, 0x38), 7); // program headers
    }

    #[test]
    fn test_section_count_formula() {
        // has_got (on fn defined), has_rela_dyn, has_plt => 11 + 2 + 1 + 2
        let (bytes, _) = build("on_start() {\n    noop()\n}\n");
        assert_eq!(read_u16(&bytes, 0x3c), 16);
        assert_eq!(read_u16(&bytes, 0x3e), 15);
    }

    #[test]
    fn test_program_header_table_starts_at_0x40() {
        let (bytes, _) = build("on_start() {\n    noop()\n}\n");
        // First program header is PT_LOAD R at offset 0
        assert_eq!(u32::from_le_bytes(bytes[0x40..0x44].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[0x44..0x48].try_into().unwrap()), 4);
    }

    #[test]
    fn test_dynsym_is_bfd_ordered() {
        let (bytes, code) = build("on_start() {\n    noop()\n}\n");

        // Rebuild the expected symbol list the way the writer does
        let mut symbols: Vec<String> = vec![
            "globals_size".into(),
            "on_fns".into(),
            "resources_size".into(),
            "entities_size".into(),
            "grug_fn_path".into(),
            "grug_fn_name".into(),
            "grug_has_runtime_error_happened".into(),
            "grug_on_fns_in_safe_mode".into(),
        ];
        symbols.extend(code.used_extern_fns.iter().cloned());
        symbols.extend(code.text_symbols.iter().cloned());

        let names: Vec<&str> = symbols.iter().map(String::as_str).collect();
        let order = bfd_order(&names);

        // Locate .dynsym: it follows .hash, which starts at 0x1c8
        let hash_offset = 0x1c8;
        let nbucket = u32::from_le_bytes(bytes[hash_offset..hash_offset + 4].try_into().unwrap());
        let nchain =
            u32::from_le_bytes(bytes[hash_offset + 4..hash_offset + 8].try_into().unwrap());
        assert_eq!(nchain as usize, symbols.len() + 1);

        let hash_size = 8 + 4 * (nbucket as usize + nchain as usize);
        let dynsym_offset = round_up(hash_offset + hash_size, 8);

        // Symbol 0 is the null entry; symbol 1 names the first
        // bfd-ordered symbol
        let dynstr_offset = dynsym_offset + (symbols.len() + 1) * 24;
        let first_name_offset = u32::from_le_bytes(
            bytes[dynsym_offset + 24..dynsym_offset + 28].try_into().unwrap(),
        ) as usize;
        let name_bytes: Vec<u8> = bytes[dynstr_offset + first_name_offset..]
            .iter()
            .take_while(|&&b| b != 0)
            .copied()
            .collect();
        assert_eq!(
            String::from_utf8(name_bytes).unwrap(),
            symbols[order[0]],
            "first .dynsym entry must be the first BFD-ordered symbol"
        );
    }

    #[test]
    fn test_globals_size_in_data_section() {
        let source = "n: i32 = 5\n\non_start() {\n    noop()\n}\n";
        let (bytes, code) = build(source);
        // me (8) + i32 (4)
        assert_eq!(code.globals_bytes, 12);

        // .data begins right after .got.plt; find it through the dynamic
        // segment program header (index 3, offset field at 0xe8 + 8)
        let data_like_offset = read_u64(&bytes, 0xf0) as usize;
        // segment 3 is .dynamic + .got + .got.plt + .data; globals_size is
        // the first 8 bytes of .data
        let dynamic_size = (11 + 4 + 3) * 16;
        let got_size = 4 * 8;
        let got_plt_size = GOT_PLT_INTRO_SIZE + 8 * code.used_extern_fns.len();
        let data_offset = data_like_offset + dynamic_size + got_size + got_plt_size;
        assert_eq!(read_u64(&bytes, data_offset), 12);
    }

    #[test]
    fn test_on_fns_slot_null_when_undefined() {
        // Entity declares on_spawn then on_start; the file only defines
        // on_start, so slot 0 must be null and slot 1 non-null
        let (bytes, code) = build("on_start() {\n    noop()\n}\n");

        let dynamic_offset = read_u64(&bytes, 0xf0) as usize;
        let dynamic_size = (11 + 4 + 3) * 16;
        let got_size = 4 * 8;
        let got_plt_size = GOT_PLT_INTRO_SIZE + 8 * code.used_extern_fns.len();
        let data_offset = dynamic_offset + dynamic_size + got_size + got_plt_size;

        let slot_0 = read_u64(&bytes, data_offset + 8);
        let slot_1 = read_u64(&bytes, data_offset + 16);
        assert_eq!(slot_0, 0);
        assert_ne!(slot_1, 0);
    }

    #[test]
    fn test_got_plt_intro_ends_before_page_boundary() {
        let (bytes, code) = build("on_start() {\n    noop()\n}\n");
        let dynamic_offset = read_u64(&bytes, 0xf0) as usize;
        let dynamic_size = (11 + 4 + 3) * 16;
        let got_size = 4 * 8;
        let got_plt_offset = dynamic_offset + dynamic_size + got_size;
        assert_eq!(
            (got_plt_offset + GOT_PLT_INTRO_SIZE) % 0x1000,
            0,
            "the three reserved .got.plt slots must end at a page boundary"
        );
        let _ = code;
    }

    #[test]
    fn test_minimal_entity_scenario() {
        // A file with no globals and one defined hook exports
        // globals_size == 8 and a non-null slot for it
        let api = test_api();
        let mut ast = parse("on_spawn() {\n    noop()\n}\n").unwrap();
        let globals = fill_result_types(&mut ast, &api, "hello", "Greeter").unwrap();
        let code = codegen::compile(
            &ast,
            &api,
            &globals,
            "mods/hello/hello-Greeter.grug",
            "hello",
            "mods",
        )
        .unwrap();
        assert_eq!(code.globals_bytes, 8);
        let entity = api.entity("Greeter").unwrap();
        let bytes = write_shared_object(&code, entity).unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn test_on_fn_order_must_match_manifest() {
        // The manifest declares on_spawn before on_start; defining them in
        // the opposite order is rejected at link time
        let api = test_api();
        let mut ast =
            parse("on_start() {\n    noop()\n}\n\non_spawn() {\n    noop()\n}\n").unwrap();
        let globals = fill_result_types(&mut ast, &api, "guns", "Greeter").unwrap();
        let code = codegen::compile(
            &ast,
            &api,
            &globals,
            "mods/guns/x-Greeter.grug",
            "guns",
            "mods",
        )
        .unwrap();
        let entity = api.entity("Greeter").unwrap();
        let err = write_shared_object(&code, entity).unwrap_err();
        assert!(err.msg.contains("needs to be moved"), "{}", err.msg);
    }

    #[test]
    fn test_resource_pointers_relocated() {
        let source = "on_start() {\n    play(\"foo.wav\")\n}\n";
        let (bytes, code) = build(source);
        assert_eq!(code.resources.len(), 1);

        // DT_RELACOUNT counts defined on_fns + resources + 2 * entities
        let expected_relacount = (code.defined_on_fns.len() + 1) as u64;
        let dynamic_offset = read_u64(&bytes, 0xf0) as usize;
        let mut found = None;
        let mut offset = dynamic_offset;
        loop {
            let tag = read_u64(&bytes, offset);
            if tag == 0 {
                break;
            }
            if tag == DT_RELACOUNT {
                found = Some(read_u64(&bytes, offset + 8));
            }
            offset += 16;
        }
        assert_eq!(found, Some(expected_relacount));
    }
}
