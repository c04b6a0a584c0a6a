//! x86-64 code generation.
//!
//! A register-allocation-free stack machine: every binary operator compiles
//! its right operand, pushes rax, compiles the left operand, pops r11, and
//! combines into rax/eax/al. Floats hop through xmm0/xmm1 as raw bits in
//! eax. Identifiers read from the frame, or through the globals pointer the
//! caller passed in rdi (spilled to `[rbp-8]` by every prologue).
//!
//! Every `on_` function carries two bodies behind a check of the
//! `grug_on_fns_in_safe_mode` byte: the safe body interleaves the sandbox
//! checks (stack floor, deadline, i32 overflow, divide-by-zero, sticky
//! game-error flag), the fast body is the same code without them. Helper
//! functions are emitted twice under `<name>_safe` / `<name>_fast` names
//! instead, so a fast-mode root never pays for a mode check in its callees.
//!
//! Calls that leave the object (game functions, the grug runtime support
//! surface, strcmp) are recorded for the PLT; reads of the runtime's global
//! flags are recorded for the GOT; string literals land in `.data` with a
//! RIP-relative LEA patched later by the linker.

use std::collections::{HashMap, HashSet};

use grug_core::abi::{self, GAME_FN_PREFIX, GRUG_STACK_LIMIT, RuntimeErrorKind};
use grug_core::Type;

use crate::ast::*;
use crate::error::{Result, bail, ensure};
use crate::modapi::ModApi;
use crate::typeck::GlobalsLayout;

const MAX_CODE_BYTES: usize = 420420;
const MAX_LOOP_DEPTH: usize = 420;

/// Distance from a rel32 field to the end of its instruction.
const NEXT_INSTRUCTION_OFFSET: usize = 4;

const GLOBAL_VARIABLES_POINTER_SIZE: usize = 8;

// 0xDEADBEEF in little-endian
const PLACEHOLDER_8: u8 = 0xde;
const PLACEHOLDER_32: u64 = 0xefbeadde;

// Start of code enums

const XOR_EAX_BY_N: u8 = 0x35; // xor eax, n
const CMP_EAX_WITH_N: u8 = 0x3d; // cmp eax, n
const PUSH_RAX: u8 = 0x50; // push rax
const PUSH_RBP: u8 = 0x55; // push rbp
const POP_RAX: u8 = 0x58; // pop rax
const POP_RCX: u64 = 0x59; // pop rcx
const POP_RDX: u64 = 0x5a; // pop rdx
const POP_RBP: u8 = 0x5d; // pop rbp
const POP_RSI: u64 = 0x5e; // pop rsi
const POP_RDI: u64 = 0x5f; // pop rdi
const JE_8_BIT_OFFSET: u8 = 0x74; // je $+n
const JNE_8_BIT_OFFSET: u8 = 0x75; // jne $+n
const JG_8_BIT_OFFSET: u8 = 0x7f; // jg $+n
const JNO_8_BIT_OFFSET: u8 = 0x71; // jno $+n
const MOV_DEREF_RAX_TO_AL: u16 = 0x8a; // mov al, [rax] (emitted as two bytes)
const CDQ_SIGN_EXTEND_EAX_BEFORE_DIVISION: u8 = 0x99; // cdq
const MOV_TO_EAX: u8 = 0xb8; // mov eax, n
const MOV_TO_EDI: u8 = 0xbf; // mov edi, n
const RET: u8 = 0xc3; // ret
const MOV_8_BIT_TO_DEREF_RAX: u16 = 0xc6; // mov [rax], byte n
const CALL: u8 = 0xe8; // call a function
const JMP_32_BIT_OFFSET: u8 = 0xe9; // jmp $+n

const MOV_DEREF_RAX_TO_EAX_8_BIT_OFFSET: u64 = 0x408b; // mov eax, rax[n]
const MOV_DEREF_RBP_TO_EAX_8_BIT_OFFSET: u64 = 0x458b; // mov eax, rbp[n]
const MOV_DEREF_RBP_TO_EAX_32_BIT_OFFSET: u64 = 0x858b; // mov eax, rbp[n]
const MOV_AL_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4588; // mov rbp[n], al
const MOV_EAX_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4589; // mov rbp[n], eax
const MOV_ECX_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4d89; // mov rbp[n], ecx
const MOV_EDX_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x5589; // mov rbp[n], edx
const POP_R8: u64 = 0x5841; // pop r8
const POP_R9: u64 = 0x5941; // pop r9
const POP_R11: u64 = 0x5b41; // pop r11
const MOV_ESI_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x7589; // mov rbp[n], esi
const MOV_DEREF_RAX_TO_EAX_32_BIT_OFFSET: u64 = 0x808b; // mov eax, rax[n]
const JE_32_BIT_OFFSET: u64 = 0x840f; // je strict $+n
const MOV_AL_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8588; // mov rbp[n], al
const MOV_EAX_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8589; // mov rbp[n], eax
const MOV_ECX_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8d89; // mov rbp[n], ecx
const MOV_EDX_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x9589; // mov rbp[n], edx
const MOV_ESI_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0xb589; // mov rbp[n], esi
const XOR_CLEAR_EAX: u64 = 0xc031; // xor eax, eax
const TEST_AL_IS_ZERO: u64 = 0xc084; // test al, al
const TEST_EAX_IS_ZERO: u64 = 0xc085; // test eax, eax
const NEGATE_EAX: u64 = 0xd8f7; // neg eax

const MOV_GLOBAL_VARIABLE_TO_RAX: u64 = 0x58b48; // mov rax, [rel foo wrt ..got]
const LEA_STRINGS_TO_RAX: u64 = 0x58d48; // lea rax, strings[rel n]
const MOV_R11_TO_DEREF_RAX: u64 = 0x18894c; // mov [rax], r11
const MOV_DEREF_R11_TO_R11B: u64 = 0x1b8a45; // mov r11b, [r11]
const MOV_GLOBAL_VARIABLE_TO_R11: u64 = 0x1d8b4c; // mov r11, [rel foo wrt ..got]
const LEA_STRINGS_TO_R11: u64 = 0x1d8d4c; // lea r11, strings[rel n]
const CMP_RSP_WITH_RAX: u64 = 0xc43948; // cmp rsp, rax
const MOV_RSP_TO_DEREF_RAX: u64 = 0x208948; // mov [rax], rsp
const SUB_DEREF_RAX_32_BITS: u64 = 0x288148; // sub qword [rax], n
const MOV_RSI_TO_DEREF_RDI: u64 = 0x378948; // mov rdi[0x0], rsi
const MOV_DEREF_RAX_TO_RAX_8_BIT_OFFSET: u64 = 0x408b48; // mov rax, rax[n]
const MOVZX_BYTE_DEREF_RAX_TO_EAX_8_BIT_OFFSET: u64 = 0x40b60f; // movzx eax, byte rax[n]
const MOV_AL_TO_DEREF_R11_8_BIT_OFFSET: u64 = 0x438841; // mov r11[n], al
const MOV_EAX_TO_DEREF_R11_8_BIT_OFFSET: u64 = 0x438941; // mov r11[n], eax
const MOV_R8D_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x458944; // mov rbp[n], r8d
const MOV_RAX_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x458948; // mov rbp[n], rax
const MOV_RAX_TO_DEREF_R11_8_BIT_OFFSET: u64 = 0x438949; // mov r11[n], rax
const MOV_R8_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x45894c; // mov rbp[n], r8
const MOV_DEREF_RBP_TO_RAX_8_BIT_OFFSET: u64 = 0x458b48; // mov rax, rbp[n]
const MOVZX_BYTE_DEREF_RBP_TO_EAX_8_BIT_OFFSET: u64 = 0x45b60f; // movzx eax, byte rbp[n]
const MOV_R9D_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4d8944; // mov rbp[n], r9d
const MOV_RCX_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4d8948; // mov rbp[n], rcx
const MOV_R9_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4d894c; // mov rbp[n], r9
const MOV_RDX_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x558948; // mov rbp[n], rdx
const MOV_DEREF_RBP_TO_R11_8_BIT_OFFSET: u64 = 0x5d8b4c; // mov r11, rbp[n]
const MOV_RSI_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x758948; // mov rbp[n], rsi
const MOV_RDI_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x7d8948; // mov rbp[n], rdi
const MOVZX_BYTE_DEREF_RAX_TO_EAX_32_BIT_OFFSET: u64 = 0x80b60f; // movzx eax, byte rax[n]
const MOV_DEREF_RAX_TO_RAX_32_BIT_OFFSET: u64 = 0x808b48; // mov rax, rax[n]
const MOV_AL_TO_DEREF_R11_32_BIT_OFFSET: u64 = 0x838841; // mov r11[n], al
const MOV_EAX_TO_DEREF_R11_32_BIT_OFFSET: u64 = 0x838941; // mov r11[n], eax
const MOV_RAX_TO_DEREF_R11_32_BIT_OFFSET: u64 = 0x838949; // mov r11[n], rax
const MOV_R8D_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x858944; // mov rbp[n], r8d
const MOV_RAX_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x858948; // mov rbp[n], rax
const MOV_R8_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x85894c; // mov rbp[n], r8
const MOV_DEREF_RBP_TO_RAX_32_BIT_OFFSET: u64 = 0x858b48; // mov rax, rbp[n]
const MOVZX_BYTE_DEREF_RBP_TO_EAX_32_BIT_OFFSET: u64 = 0x85b60f; // movzx eax, byte rbp[n]
const MOV_R9D_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8d8944; // mov rbp[n], r9d
const MOV_RCX_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8d8948; // mov rbp[n], rcx
const MOV_R9_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8d894c; // mov rbp[n], r9
const MOV_RDX_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x958948; // mov rbp[n], rdx
const MOV_RSI_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0xb58948; // mov rbp[n], rsi

const SETB_AL: u64 = 0xc0920f; // setb al (set if below)
const SETAE_AL: u64 = 0xc0930f; // setae al (set if above or equal)
const SETE_AL: u64 = 0xc0940f; // sete al
const SETNE_AL: u64 = 0xc0950f; // setne al
const SETBE_AL: u64 = 0xc0960f; // setbe al (set if below or equal)
const SETA_AL: u64 = 0xc0970f; // seta al (set if above)
const SETGT_AL: u64 = 0xc09f0f; // setg al
const SETGE_AL: u64 = 0xc09d0f; // setge al
const SETLT_AL: u64 = 0xc09c0f; // setl al
const SETLE_AL: u64 = 0xc09e0f; // setle al

// See this for an explanation of "ordered" vs. "unordered":
// https://stackoverflow.com/a/8627368/13279557
const ORDERED_CMP_XMM0_WITH_XMM1: u64 = 0xc12f0f; // comiss xmm0, xmm1

const ADD_RSP_32_BITS: u64 = 0xc48148; // add rsp, n
const ADD_RSP_8_BITS: u64 = 0xc48348; // add rsp, n
const MOV_RAX_TO_RDI: u64 = 0xc78948; // mov rdi, rax
const MOV_RDX_TO_RAX: u64 = 0xd08948; // mov rax, rdx
const ADD_R11D_TO_EAX: u64 = 0xd80144; // add eax, r11d
const SUB_R11D_FROM_EAX: u64 = 0xd82944; // sub eax, r11d
const CMP_EAX_WITH_R11D: u64 = 0xd83944; // cmp eax, r11d
const CMP_RAX_WITH_R11: u64 = 0xd8394c; // cmp rax, r11
const TEST_R11B_IS_ZERO: u64 = 0xdb8445; // test r11b, r11b
const TEST_R11_IS_ZERO: u64 = 0xdb854d; // test r11, r11
const MOV_R11_TO_RSI: u64 = 0xde894c; // mov rsi, r11
const MOV_RSP_TO_RBP: u64 = 0xe58948; // mov rbp, rsp
const IMUL_EAX_BY_R11D: u64 = 0xebf741; // imul r11d
const SUB_RSP_8_BITS: u64 = 0xec8348; // sub rsp, n
const SUB_RSP_32_BITS: u64 = 0xec8148; // sub rsp, n
const MOV_RBP_TO_RSP: u64 = 0xec8948; // mov rsp, rbp
const CMP_R11D_WITH_N: u64 = 0xfb8141; // cmp r11d, n
const DIV_RAX_BY_R11D: u64 = 0xfbf741; // idiv r11d

const MOV_XMM0_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x45110ff3; // movss rbp[n], xmm0
const MOV_XMM1_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x4d110ff3; // movss rbp[n], xmm1
const MOV_XMM2_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x55110ff3; // movss rbp[n], xmm2
const MOV_XMM3_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x5d110ff3; // movss rbp[n], xmm3
const MOV_XMM4_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x65110ff3; // movss rbp[n], xmm4
const MOV_XMM5_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x6d110ff3; // movss rbp[n], xmm5
const MOV_XMM6_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x75110ff3; // movss rbp[n], xmm6
const MOV_XMM7_TO_DEREF_RBP_8_BIT_OFFSET: u64 = 0x7d110ff3; // movss rbp[n], xmm7

const MOV_XMM0_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x85110ff3; // movss rbp[n], xmm0
const MOV_XMM1_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x8d110ff3; // movss rbp[n], xmm1
const MOV_XMM2_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x95110ff3; // movss rbp[n], xmm2
const MOV_XMM3_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0x9d110ff3; // movss rbp[n], xmm3
const MOV_XMM4_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0xa5110ff3; // movss rbp[n], xmm4
const MOV_XMM5_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0xad110ff3; // movss rbp[n], xmm5
const MOV_XMM6_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0xb5110ff3; // movss rbp[n], xmm6
const MOV_XMM7_TO_DEREF_RBP_32_BIT_OFFSET: u64 = 0xbd110ff3; // movss rbp[n], xmm7

const MOV_EAX_TO_XMM0: u64 = 0xc06e0f66; // movd xmm0, eax
const MOV_XMM0_TO_EAX: u64 = 0xc07e0f66; // movd eax, xmm0
const ADD_XMM1_TO_XMM0: u64 = 0xc1580ff3; // addss xmm0, xmm1
const MUL_XMM0_WITH_XMM1: u64 = 0xc1590ff3; // mulss xmm0, xmm1
const SUB_XMM1_FROM_XMM0: u64 = 0xc15c0ff3; // subss xmm0, xmm1
const DIV_XMM0_BY_XMM1: u64 = 0xc15e0ff3; // divss xmm0, xmm1
const MOV_EAX_TO_XMM1: u64 = 0xc86e0f66; // movd xmm1, eax
const MOV_EAX_TO_XMM2: u64 = 0xd06e0f66; // movd xmm2, eax
const MOV_EAX_TO_XMM3: u64 = 0xd86e0f66; // movd xmm3, eax
const MOV_EAX_TO_XMM4: u64 = 0xe06e0f66; // movd xmm4, eax
const MOV_EAX_TO_XMM5: u64 = 0xe86e0f66; // movd xmm5, eax
const MOV_EAX_TO_XMM6: u64 = 0xf06e0f66; // movd xmm6, eax
const MOV_EAX_TO_XMM7: u64 = 0xf86e0f66; // movd xmm7, eax
const MOV_R11D_TO_XMM1: u64 = 0xcb6e0f4166; // movd xmm1, r11d

// End of code enums

/// A symbol use inside `.text` that the linker patches later.
#[derive(Debug, Clone)]
pub struct Reloc {
    pub name: String,
    /// Offset of the rel32 field within the code buffer.
    pub offset: usize,
}

/// Everything the ELF writer needs about one compiled file.
#[derive(Debug, Default)]
pub struct ObjectCode {
    pub code: Vec<u8>,
    /// Start offset of each text symbol: `init_globals`, every defined
    /// `on_` fn in file order, then `_safe`/`_fast` pairs per helper.
    pub text_offsets: Vec<usize>,
    pub text_symbols: Vec<String>,

    /// Interned `.data` strings, in first-use order.
    pub data_strings: Vec<String>,
    data_string_index: HashMap<String, u32>,
    /// (string index, rel32 offset) pairs for RIP-relative LEAs.
    pub data_string_relocs: Vec<(u32, usize)>,

    /// Calls that resolve through the PLT (`game_fn_*` and the runtime
    /// support surface).
    pub extern_fn_calls: Vec<Reloc>,
    /// The distinct imported functions, in first-call order.
    pub used_extern_fns: Vec<String>,
    /// Intra-module calls to `<helper>_safe` / `<helper>_fast`.
    pub helper_fn_calls: Vec<Reloc>,
    pub helper_fn_offsets: HashMap<String, usize>,
    /// rel32 loads of imported globals, resolved through the GOT.
    pub used_extern_globals: Vec<Reloc>,

    /// Indices into `data_strings`, deduplicated.
    pub resources: Vec<u32>,
    /// Indices into `data_strings`, one per entity literal occurrence.
    pub entity_dependencies: Vec<u32>,
    /// Parallel to `entity_dependencies`.
    pub entity_types: Vec<u32>,

    pub globals_bytes: usize,
    /// Slot count of the globals block, `me` included.
    pub global_variables_count: usize,
    pub defined_on_fns: Vec<String>,
    pub helper_fns: Vec<String>,
}

impl ObjectCode {
    pub fn data_string_index(&self, s: &str) -> Option<u32> {
        self.data_string_index.get(s).copied()
    }
}

pub fn helper_fn_mode_name(name: &str, safe: bool) -> String {
    format!("{}{}", name, if safe { "_safe" } else { "_fast" })
}

struct Local {
    ty: Type,
    /// Bytes below rbp; `usize::MAX` marks a variable whose scope was
    /// exited.
    offset: usize,
}

struct LoopFrame {
    start_offset: usize,
    break_offsets: Vec<usize>,
}

pub struct CodeGen<'a> {
    ast: &'a GrugFileAst,
    api: &'a ModApi,
    globals: &'a GlobalsLayout,
    grug_path: &'a str,
    mod_name: &'a str,
    mods_root: &'a str,

    out: ObjectCode,
    used_extern_fn_seen: HashSet<String>,

    locals: Vec<Local>,
    local_index: HashMap<String, Vec<usize>>,
    stack_frame_bytes: usize,
    max_stack_frame_bytes: usize,
    pushed: usize,
    loops: Vec<LoopFrame>,
    fast_mode: bool,
    compiled_init_globals: bool,
}

/// Compile a type-checked file into machine code plus relocation tables.
pub fn compile(
    ast: &GrugFileAst,
    api: &ModApi,
    globals: &GlobalsLayout,
    grug_path: &str,
    mod_name: &str,
    mods_root: &str,
) -> Result<ObjectCode> {
    let mut codegen = CodeGen {
        ast,
        api,
        globals,
        grug_path,
        mod_name,
        mods_root,
        out: ObjectCode::default(),
        used_extern_fn_seen: HashSet::new(),
        locals: Vec::new(),
        local_index: HashMap::new(),
        stack_frame_bytes: 0,
        max_stack_frame_bytes: 0,
        pushed: 0,
        loops: Vec::new(),
        fast_mode: false,
        compiled_init_globals: false,
    };
    codegen.compile_file()?;
    Ok(codegen.out)
}

impl<'a> CodeGen<'a> {
    // ---- Byte emission ----

    fn emit8(&mut self, byte: u8) -> Result<()> {
        ensure!(
            self.out.code.len() < MAX_CODE_BYTES,
            "There are more than {} code bytes, exceeding the maximum",
            MAX_CODE_BYTES
        );
        self.out.code.push(byte);
        Ok(())
    }

    fn emit_padded(&mut self, mut n: u64, byte_count: usize) -> Result<()> {
        for _ in 0..byte_count {
            self.emit8((n & 0xff) as u8)?; // Little-endian
            n >>= 8;
        }
        Ok(())
    }

    fn emit16(&mut self, n: u16) -> Result<()> {
        self.emit_padded(u64::from(n), 2)
    }

    fn emit32(&mut self, n: u32) -> Result<()> {
        self.emit_padded(u64::from(n), 4)
    }

    /// Emit the low-to-high bytes of `n` until it runs out; the opcode
    /// constants above are written so this produces the instruction bytes
    /// in order.
    fn emit(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            self.emit8((n & 0xff) as u8)?; // Little-endian
            n >>= 8;
        }
        Ok(())
    }

    fn here(&self) -> usize {
        self.out.code.len()
    }

    fn overwrite_jmp8(&mut self, jump_offset: usize, target: usize) {
        debug_assert!(target > jump_offset);
        self.out.code[jump_offset] = (target - (jump_offset + 1)) as u8;
    }

    fn overwrite_jmp32(&mut self, jump_offset: usize, target: usize) {
        debug_assert!(target > jump_offset);
        let rel = (target - (jump_offset + 4)) as u32;
        self.out.code[jump_offset..jump_offset + 4].copy_from_slice(&rel.to_le_bytes());
    }

    // ---- Expression stack ----

    fn stack_push_rax(&mut self) -> Result<()> {
        self.emit8(PUSH_RAX)?;
        self.stack_frame_bytes += 8;
        self.pushed += 1;
        Ok(())
    }

    fn stack_pop_r11(&mut self) -> Result<()> {
        self.emit(POP_R11)?;
        self.stack_frame_bytes -= 8;
        debug_assert!(self.pushed > 0);
        self.pushed -= 1;
        Ok(())
    }

    // ---- Locals ----

    fn get_local(&self, name: &str) -> Option<&Local> {
        let indices = self.local_index.get(name)?;
        indices
            .iter()
            .rev()
            .map(|&i| &self.locals[i])
            .find(|v| v.offset != usize::MAX)
    }

    fn add_local(&mut self, name: &str, ty: Type) {
        // Shadowing was already rejected during type propagation.
        self.stack_frame_bytes += ty.size();
        self.local_index
            .entry(name.to_string())
            .or_default()
            .push(self.locals.len());
        self.locals.push(Local { ty, offset: self.stack_frame_bytes });
    }

    fn mark_scope_unreachable(&mut self, body: &[Statement]) {
        for statement in body {
            if let Statement::Variable(var) = statement
                && var.declared_type.is_some()
            {
                if let Some(indices) = self.local_index.get(&var.name) {
                    for &i in indices.iter().rev() {
                        if self.locals[i].offset != usize::MAX {
                            self.stack_frame_bytes -= self.locals[i].ty.size();
                            self.locals[i].offset = usize::MAX;
                            break;
                        }
                    }
                }
            }
        }
    }

    // ---- Interning and relocation records ----

    fn add_data_string(&mut self, s: &str) -> u32 {
        if let Some(&index) = self.out.data_string_index.get(s) {
            return index;
        }
        let index = self.out.data_strings.len() as u32;
        self.out.data_strings.push(s.to_string());
        self.out.data_string_index.insert(s.to_string(), index);
        index
    }

    /// LEA of an interned string into the given register opcode; records
    /// the rel32 for the linker.
    fn emit_string_lea(&mut self, opcode: u64, s: &str) -> Result<()> {
        let index = self.add_data_string(s);
        self.emit(opcode)?;
        self.out.data_string_relocs.push((index, self.here()));
        self.emit(PLACEHOLDER_32)
    }

    fn push_extern_fn_call(&mut self, symbol: String, offset: usize) {
        if self.used_extern_fn_seen.insert(symbol.clone()) {
            self.out.used_extern_fns.push(symbol.clone());
        }
        self.out.extern_fn_calls.push(Reloc { name: symbol, offset });
    }

    /// `call` into the runtime support surface (or strcmp), via the PLT.
    fn emit_system_fn_call(&mut self, name: &str) -> Result<()> {
        self.emit8(CALL)?;
        let offset = self.here();
        self.push_extern_fn_call(name.to_string(), offset);
        self.emit(PLACEHOLDER_32)
    }

    /// `mov <reg>, [rel name wrt ..got]`; records the rel32 for the linker.
    fn emit_global_load(&mut self, opcode: u64, name: &str) -> Result<()> {
        self.emit(opcode)?;
        let offset = self.here();
        self.out.used_extern_globals.push(Reloc { name: name.to_string(), offset });
        self.emit(PLACEHOLDER_32)
    }

    // ---- Sandbox check sequences (safe mode only) ----

    fn emit_function_epilogue(&mut self) -> Result<()> {
        self.emit(MOV_RBP_TO_RSP)?;
        self.emit8(POP_RBP)?;
        self.emit8(RET)
    }

    /// Set the sticky flag, classify, dispatch to the host handler, and
    /// return from the current frame.
    fn emit_runtime_error(&mut self, kind: RuntimeErrorKind) -> Result<()> {
        // mov rax, [rel grug_has_runtime_error_happened wrt ..got]
        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_RAX, abi::global::HAS_RUNTIME_ERROR_HAPPENED)?;

        // mov [rax], byte 1
        self.emit16(MOV_8_BIT_TO_DEREF_RAX)?;
        self.emit8(1)?;

        // mov edi, kind
        self.emit8(MOV_TO_EDI)?;
        self.emit32(kind as u32)?;

        // call grug_call_runtime_error_handler wrt ..plt
        self.emit_system_fn_call(abi::import::CALL_RUNTIME_ERROR_HANDLER)?;

        self.emit_function_epilogue()
    }

    /// After a helper call: if the sticky flag is set, unwind this frame
    /// too.
    fn emit_return_if_runtime_error(&mut self) -> Result<()> {
        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_R11, abi::global::HAS_RUNTIME_ERROR_HAPPENED)?;
        self.emit(MOV_DEREF_R11_TO_R11B)?;
        self.emit(TEST_R11B_IS_ZERO)?;

        self.emit8(JE_8_BIT_OFFSET)?;
        let skip = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit_function_epilogue()?;

        let here = self.here();
        self.overwrite_jmp8(skip, here);
        Ok(())
    }

    /// After a game function call: if the game signalled bad arguments,
    /// raise GAME_FN_ERROR and unwind.
    fn emit_check_game_fn_error(&mut self) -> Result<()> {
        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_R11, abi::global::HAS_RUNTIME_ERROR_HAPPENED)?;
        self.emit(MOV_DEREF_R11_TO_R11B)?;
        self.emit(TEST_R11B_IS_ZERO)?;

        self.emit8(JE_8_BIT_OFFSET)?;
        let skip = self.here();
        self.emit8(PLACEHOLDER_8)?;

        // The flag is already set, so just classify and dispatch
        self.emit8(MOV_TO_EDI)?;
        self.emit32(RuntimeErrorKind::GameFnError as u32)?;
        self.emit_system_fn_call(abi::import::CALL_RUNTIME_ERROR_HANDLER)?;
        self.emit_function_epilogue()?;

        let here = self.here();
        self.overwrite_jmp8(skip, here);
        Ok(())
    }

    /// After i32 `+ - *` and unary `-`.
    fn emit_check_overflow(&mut self) -> Result<()> {
        self.emit8(JNO_8_BIT_OFFSET)?;
        let skip = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit_runtime_error(RuntimeErrorKind::Overflow)?;

        let here = self.here();
        self.overwrite_jmp8(skip, here);
        Ok(())
    }

    /// INT_MIN / -1 (and %) traps instead of faulting.
    fn emit_check_division_overflow(&mut self) -> Result<()> {
        self.emit8(CMP_EAX_WITH_N)?;
        self.emit32(i32::MIN as u32)?;

        self.emit8(JNE_8_BIT_OFFSET)?;
        let skip_1 = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit(CMP_R11D_WITH_N)?;
        self.emit32(-1i32 as u32)?;

        self.emit8(JNE_8_BIT_OFFSET)?;
        let skip_2 = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit_runtime_error(RuntimeErrorKind::Overflow)?;

        let here = self.here();
        self.overwrite_jmp8(skip_1, here);
        self.overwrite_jmp8(skip_2, here);
        Ok(())
    }

    fn emit_check_division_by_0(&mut self) -> Result<()> {
        self.emit(TEST_R11_IS_ZERO)?;

        self.emit8(JNE_8_BIT_OFFSET)?;
        let skip = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit_runtime_error(RuntimeErrorKind::DivisionByZero)?;

        let here = self.here();
        self.overwrite_jmp8(skip, here);
        Ok(())
    }

    fn emit_check_time_limit_exceeded(&mut self) -> Result<()> {
        self.emit_system_fn_call(abi::import::IS_TIME_LIMIT_EXCEEDED)?;
        self.emit(TEST_AL_IS_ZERO)?;

        self.emit8(JE_8_BIT_OFFSET)?;
        let skip = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit_runtime_error(RuntimeErrorKind::TimeLimitExceeded)?;

        let here = self.here();
        self.overwrite_jmp8(skip, here);
        Ok(())
    }

    /// Helper entry: compare rsp against the floor the root `on_` recorded.
    fn emit_check_stack_overflow(&mut self) -> Result<()> {
        self.emit_system_fn_call(abi::import::GET_MAX_RSP)?;
        self.emit(CMP_RSP_WITH_RAX)?;

        self.emit8(JG_8_BIT_OFFSET)?;
        let skip = self.here();
        self.emit8(PLACEHOLDER_8)?;

        self.emit_runtime_error(RuntimeErrorKind::StackOverflow)?;

        let here = self.here();
        self.overwrite_jmp8(skip, here);
        Ok(())
    }

    fn emit_clear_has_runtime_error_happened(&mut self) -> Result<()> {
        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_RAX, abi::global::HAS_RUNTIME_ERROR_HAPPENED)?;
        self.emit16(MOV_8_BIT_TO_DEREF_RAX)?;
        self.emit8(0)
    }

    /// Record the running function's name and path for the error handler.
    fn emit_save_fn_name_and_path(&mut self, fn_name: &str) -> Result<()> {
        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_RAX, abi::global::FN_PATH)?;
        let path = self.grug_path;
        self.emit_string_lea(LEA_STRINGS_TO_R11, path)?;
        self.emit(MOV_R11_TO_DEREF_RAX)?;

        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_RAX, abi::global::FN_NAME)?;
        self.emit_string_lea(LEA_STRINGS_TO_R11, fn_name)?;
        self.emit(MOV_R11_TO_DEREF_RAX)
    }

    // ---- Expressions ----

    fn compile_logical_expr(&mut self, op: LogicalOp, lhs: &Expr, rhs: &Expr) -> Result<()> {
        match op {
            LogicalOp::And => {
                self.compile_expr(lhs)?;
                self.emit(TEST_AL_IS_ZERO)?;
                self.emit(JE_32_BIT_OFFSET)?;
                let end = self.here();
                self.emit(PLACEHOLDER_32)?;
                self.compile_expr(rhs)?;
                self.emit(TEST_AL_IS_ZERO)?;
                self.emit8(MOV_TO_EAX)?;
                self.emit32(0)?;
                self.emit(SETNE_AL)?;
                let here = self.here();
                self.overwrite_jmp32(end, here);
            }
            LogicalOp::Or => {
                self.compile_expr(lhs)?;
                self.emit(TEST_AL_IS_ZERO)?;
                self.emit8(JE_8_BIT_OFFSET)?;
                self.emit8(10)?; // over the mov+jmp below
                self.emit8(MOV_TO_EAX)?;
                self.emit32(1)?;
                self.emit8(JMP_32_BIT_OFFSET)?;
                let end = self.here();
                self.emit(PLACEHOLDER_32)?;
                self.compile_expr(rhs)?;
                self.emit(TEST_AL_IS_ZERO)?;
                self.emit8(MOV_TO_EAX)?;
                self.emit32(0)?;
                self.emit(SETNE_AL)?;
                let here = self.here();
                self.overwrite_jmp32(end, here);
            }
        }
        Ok(())
    }

    fn emit_i32_compare_set(&mut self, set_opcode: u64) -> Result<()> {
        self.emit(CMP_EAX_WITH_R11D)?;
        self.emit8(MOV_TO_EAX)?;
        self.emit32(0)?;
        self.emit(set_opcode)
    }

    fn emit_f32_compare_set(&mut self, set_opcode: u64) -> Result<()> {
        self.emit(MOV_EAX_TO_XMM0)?;
        self.emit(MOV_R11D_TO_XMM1)?;
        self.emit(XOR_CLEAR_EAX)?;
        self.emit(ORDERED_CMP_XMM0_WITH_XMM1)?;
        self.emit(set_opcode)
    }

    fn emit_f32_arith(&mut self, arith_opcode: u64) -> Result<()> {
        self.emit(MOV_EAX_TO_XMM0)?;
        self.emit(MOV_R11D_TO_XMM1)?;
        self.emit(arith_opcode)?;
        self.emit(MOV_XMM0_TO_EAX)
    }

    fn compile_binary_expr(&mut self, expr: &Expr) -> Result<()> {
        let ExprKind::Binary { op, lhs, rhs } = &expr.kind else {
            unreachable!("compile_binary_expr only sees binary expressions");
        };

        self.compile_expr(rhs)?;
        self.stack_push_rax()?;
        self.compile_expr(lhs)?;
        self.stack_pop_r11()?;

        let operand_type = lhs.result_type;

        match op {
            BinaryOp::Add => {
                if expr.result_type == Type::I32 {
                    self.emit(ADD_R11D_TO_EAX)?;
                    if !self.fast_mode {
                        self.emit_check_overflow()?;
                    }
                } else {
                    self.emit_f32_arith(ADD_XMM1_TO_XMM0)?;
                }
            }
            BinaryOp::Sub => {
                if expr.result_type == Type::I32 {
                    self.emit(SUB_R11D_FROM_EAX)?;
                    if !self.fast_mode {
                        self.emit_check_overflow()?;
                    }
                } else {
                    self.emit_f32_arith(SUB_XMM1_FROM_XMM0)?;
                }
            }
            BinaryOp::Mul => {
                if expr.result_type == Type::I32 {
                    self.emit(IMUL_EAX_BY_R11D)?;
                    if !self.fast_mode {
                        self.emit_check_overflow()?;
                    }
                } else {
                    self.emit_f32_arith(MUL_XMM0_WITH_XMM1)?;
                }
            }
            BinaryOp::Div => {
                if expr.result_type == Type::I32 {
                    if !self.fast_mode {
                        self.emit_check_division_by_0()?;
                        self.emit_check_division_overflow()?;
                    }
                    self.emit8(CDQ_SIGN_EXTEND_EAX_BEFORE_DIVISION)?;
                    self.emit(DIV_RAX_BY_R11D)?;
                } else {
                    self.emit_f32_arith(DIV_XMM0_BY_XMM1)?;
                }
            }
            BinaryOp::Rem => {
                if !self.fast_mode {
                    self.emit_check_division_by_0()?;
                    self.emit_check_division_overflow()?;
                }
                self.emit8(CDQ_SIGN_EXTEND_EAX_BEFORE_DIVISION)?;
                self.emit(DIV_RAX_BY_R11D)?;
                self.emit(MOV_RDX_TO_RAX)?;
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let set = if *op == BinaryOp::Eq { SETE_AL } else { SETNE_AL };
                match operand_type {
                    Type::Bool | Type::I32 => self.emit_i32_compare_set(set)?,
                    Type::F32 => self.emit_f32_compare_set(set)?,
                    Type::Id => {
                        self.emit(CMP_RAX_WITH_R11)?;
                        self.emit8(MOV_TO_EAX)?;
                        self.emit32(0)?;
                        self.emit(set)?;
                    }
                    _ => {
                        // String equality defers to strcmp
                        self.emit(MOV_R11_TO_RSI)?;
                        self.emit(MOV_RAX_TO_RDI)?;
                        self.emit_system_fn_call(abi::import::STRCMP)?;
                        self.emit(TEST_EAX_IS_ZERO)?;
                        self.emit(set)?;
                    }
                }
            }
            BinaryOp::Ge => {
                if operand_type == Type::I32 {
                    self.emit_i32_compare_set(SETGE_AL)?;
                } else {
                    self.emit_f32_compare_set(SETAE_AL)?;
                }
            }
            BinaryOp::Gt => {
                if operand_type == Type::I32 {
                    self.emit_i32_compare_set(SETGT_AL)?;
                } else {
                    self.emit_f32_compare_set(SETA_AL)?;
                }
            }
            BinaryOp::Le => {
                if operand_type == Type::I32 {
                    self.emit_i32_compare_set(SETLE_AL)?;
                } else {
                    self.emit_f32_compare_set(SETBE_AL)?;
                }
            }
            BinaryOp::Lt => {
                if operand_type == Type::I32 {
                    self.emit_i32_compare_set(SETLT_AL)?;
                } else {
                    self.emit_f32_compare_set(SETB_AL)?;
                }
            }
        }
        Ok(())
    }

    fn compile_unary_expr(&mut self, op: UnaryOp, operand: &Expr) -> Result<()> {
        match op {
            UnaryOp::Neg => {
                self.compile_expr(operand)?;
                if operand.result_type == Type::I32 {
                    self.emit(NEGATE_EAX)?;
                    if !self.fast_mode {
                        self.emit_check_overflow()?;
                    }
                } else {
                    // Flip the f32 sign bit
                    self.emit8(XOR_EAX_BY_N)?;
                    self.emit32(0x8000_0000)?;
                }
            }
            UnaryOp::Not => {
                self.compile_expr(operand)?;
                self.emit(TEST_AL_IS_ZERO)?;
                self.emit8(MOV_TO_EAX)?;
                self.emit32(0)?;
                self.emit(SETE_AL)?;
            }
        }
        Ok(())
    }

    fn resource_path(&self, s: &str) -> String {
        format!("{}/{}/{}", self.mods_root, self.mod_name, s)
    }

    fn entity_dependency_name(&self, s: &str) -> String {
        if s.contains(':') {
            s.to_string()
        } else {
            format!("{}:{}", self.mod_name, s)
        }
    }

    fn compile_identifier(&mut self, name: &str) -> Result<()> {
        if let Some(var) = self.get_local(name) {
            let offset = var.offset;
            let small = offset <= 0x80;
            let opcode = match (var.ty, small) {
                (Type::Bool, true) => MOVZX_BYTE_DEREF_RBP_TO_EAX_8_BIT_OFFSET,
                (Type::Bool, false) => MOVZX_BYTE_DEREF_RBP_TO_EAX_32_BIT_OFFSET,
                (Type::I32 | Type::F32, true) => MOV_DEREF_RBP_TO_EAX_8_BIT_OFFSET,
                (Type::I32 | Type::F32, false) => MOV_DEREF_RBP_TO_EAX_32_BIT_OFFSET,
                (Type::String | Type::Id, true) => MOV_DEREF_RBP_TO_RAX_8_BIT_OFFSET,
                (Type::String | Type::Id, false) => MOV_DEREF_RBP_TO_RAX_32_BIT_OFFSET,
                _ => bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!"),
            };
            self.emit(opcode)?;
            if small {
                self.emit8((offset as u8).wrapping_neg())?;
            } else {
                self.emit32((offset as u32).wrapping_neg())?;
            }
            return Ok(());
        }

        // Globals are reached through the pointer saved at [rbp-8]
        self.emit(MOV_DEREF_RBP_TO_RAX_8_BIT_OFFSET)?;
        self.emit8((GLOBAL_VARIABLES_POINTER_SIZE as u8).wrapping_neg())?;

        let Some(var) = self.globals.get(name) else {
            bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
        };
        let offset = var.offset;
        let small = offset < 0x80;
        let opcode = match (var.ty, small) {
            (Type::Bool, true) => MOVZX_BYTE_DEREF_RAX_TO_EAX_8_BIT_OFFSET,
            (Type::Bool, false) => MOVZX_BYTE_DEREF_RAX_TO_EAX_32_BIT_OFFSET,
            (Type::I32 | Type::F32, true) => MOV_DEREF_RAX_TO_EAX_8_BIT_OFFSET,
            (Type::I32 | Type::F32, false) => MOV_DEREF_RAX_TO_EAX_32_BIT_OFFSET,
            (Type::String | Type::Id, true) => MOV_DEREF_RAX_TO_RAX_8_BIT_OFFSET,
            (Type::String | Type::Id, false) => MOV_DEREF_RAX_TO_RAX_32_BIT_OFFSET,
            _ => bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!"),
        };
        self.emit(opcode)?;
        if small {
            self.emit8(offset as u8)?;
        } else {
            self.emit32(offset as u32)?;
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::True => {
                self.emit8(MOV_TO_EAX)?;
                self.emit32(1)?;
            }
            ExprKind::False => {
                self.emit(XOR_CLEAR_EAX)?;
            }
            ExprKind::StringLit(s) => {
                self.emit_string_lea(LEA_STRINGS_TO_RAX, s)?;
            }
            ExprKind::Resource(s) => {
                let path = self.resource_path(s);
                let had_string = self.out.data_string_index.contains_key(&path);
                let index = self.add_data_string(&path);
                if !had_string {
                    self.out.resources.push(index);
                }
                self.emit_string_lea(LEA_STRINGS_TO_RAX, &path)?;
            }
            ExprKind::EntityRef(s) => {
                let name = self.entity_dependency_name(s);
                // The fast body compiles the same literal a second time;
                // only the safe pass feeds the exported entities array. The
                // array deliberately keeps duplicates: the same entity name
                // can be demanded with different entity_type tags by
                // different callees.
                if !self.fast_mode {
                    let index = self.add_data_string(&name);
                    self.out.entity_dependencies.push(index);
                }
                self.emit_string_lea(LEA_STRINGS_TO_RAX, &name)?;
            }
            ExprKind::Identifier(name) => {
                self.compile_identifier(name)?;
            }
            ExprKind::I32(n) => {
                if *n == 0 {
                    self.emit(XOR_CLEAR_EAX)?;
                } else {
                    self.emit8(MOV_TO_EAX)?;
                    self.emit32(*n as u32)?;
                }
            }
            ExprKind::F32 { value, .. } => {
                self.emit8(MOV_TO_EAX)?;
                for byte in value.to_le_bytes() {
                    self.emit8(byte)?;
                }
            }
            ExprKind::Unary { op, operand } => self.compile_unary_expr(*op, operand)?,
            ExprKind::Binary { .. } => self.compile_binary_expr(expr)?,
            ExprKind::Logical { op, lhs, rhs } => self.compile_logical_expr(*op, lhs, rhs)?,
            ExprKind::Call { .. } => self.compile_call_expr(expr)?,
            ExprKind::Parenthesized(inner) => self.compile_expr(inner)?,
        }
        Ok(())
    }

    fn compile_call_expr(&mut self, expr: &Expr) -> Result<()> {
        let ExprKind::Call { name, args } = &expr.kind else {
            unreachable!("compile_call_expr only sees call expressions");
        };
        let fn_name = name.clone();

        let ast = self.ast;
        let helper_fn = ast.helper_fn(&fn_name);
        let calls_helper_fn = helper_fn.is_some();
        let helper_returns_float = helper_fn.is_some_and(|f| f.return_type == Type::F32);

        // "integer" refers to the System V classification: bools, i32s and
        // pointers travel in the general purpose registers.
        let mut integer_argument_count = usize::from(calls_helper_fn);
        let mut float_argument_count = 0usize;
        for arg in args {
            if arg.result_type == Type::F32 {
                float_argument_count += 1;
            } else {
                integer_argument_count += 1;
            }
        }

        let mut pushes = 0usize;
        if float_argument_count > 8 {
            pushes += float_argument_count - 8;
        }
        if integer_argument_count > 6 {
            pushes += integer_argument_count - 6;
        }

        // The spilled args stay pushed across the CALL, so the parity of
        // everything pushed so far decides the padding, and it has to be
        // known before the argument expressions run.
        self.pushed += pushes;
        let requires_padding = self.pushed % 2 == 1;
        if requires_padding {
            self.emit(SUB_RSP_8_BITS)?;
            self.emit8(8)?;
            self.stack_frame_bytes += 8;
        }
        self.pushed -= pushes;

        // 1-based positions of the last argument that spills, per class, so
        // the register-bound args aren't pushed twice
        let mut float_pos = args.len();
        let mut integer_pos = args.len();

        // Push the args that spill onto the stack
        for i in (1..=args.len()).rev() {
            let arg = &args[i - 1];
            if arg.result_type == Type::F32 {
                if float_argument_count > 8 {
                    float_argument_count -= 1;
                    float_pos = i - 1;
                    self.compile_expr(arg)?;
                    self.stack_push_rax()?;
                }
            } else if integer_argument_count > 6 {
                integer_argument_count -= 1;
                integer_pos = i - 1;
                self.compile_expr(arg)?;
                self.stack_push_rax()?;
            }
        }
        debug_assert!(integer_argument_count <= 6);
        debug_assert!(float_argument_count <= 8);

        // Push the args that go to registers
        for i in (1..=args.len()).rev() {
            let arg = &args[i - 1];
            if arg.result_type == Type::F32 {
                if i <= float_pos {
                    self.compile_expr(arg)?;
                    self.stack_push_rax()?;
                }
            } else if i <= integer_pos {
                self.compile_expr(arg)?;
                self.stack_push_rax()?;
            }
        }

        if calls_helper_fn {
            // The secret globals pointer is the helper's first argument
            self.emit(MOV_DEREF_RBP_TO_RAX_8_BIT_OFFSET)?;
            self.emit8((GLOBAL_VARIABLES_POINTER_SIZE as u8).wrapping_neg())?;
            self.stack_push_rax()?;
        }

        let popped_argument_count = integer_argument_count + float_argument_count;

        // The pops below go through lookup tables, so account for them in
        // one step
        debug_assert!(self.pushed >= popped_argument_count);
        self.pushed -= popped_argument_count;
        self.stack_frame_bytes -= popped_argument_count * 8;

        let mut popped_floats = 0usize;
        let mut popped_integers = 0usize;

        if calls_helper_fn {
            self.emit(POP_RDI)?;
            popped_integers += 1;
        }

        for arg in args {
            if arg.result_type == Type::F32 {
                if popped_floats < float_argument_count {
                    self.emit8(POP_RAX)?;
                    const MOVS: [u64; 8] = [
                        MOV_EAX_TO_XMM0,
                        MOV_EAX_TO_XMM1,
                        MOV_EAX_TO_XMM2,
                        MOV_EAX_TO_XMM3,
                        MOV_EAX_TO_XMM4,
                        MOV_EAX_TO_XMM5,
                        MOV_EAX_TO_XMM6,
                        MOV_EAX_TO_XMM7,
                    ];
                    self.emit(MOVS[popped_floats])?;
                    popped_floats += 1;
                }
            } else if popped_integers < integer_argument_count {
                const POPS: [u64; 6] =
                    [POP_RDI, POP_RSI, POP_RDX, POP_RCX, POP_R8, POP_R9];
                self.emit(POPS[popped_integers])?;
                popped_integers += 1;
            }
        }

        self.emit8(CALL)?;

        let api = self.api;
        let game_fn = api.game_fn(&fn_name);

        // Record the entity_type tag of every entity parameter, parallel to
        // the entities entries the argument literals produced above
        if !self.fast_mode
            && let Some(game_fn) = game_fn
        {
            let tags: Vec<String> = game_fn
                .params
                .iter()
                .filter(|p| p.ty == Type::Entity)
                .map(|p| p.entity_type.clone().unwrap_or_default())
                .collect();
            for tag in tags {
                let index = self.add_data_string(&tag);
                self.out.entity_types.push(index);
            }
        }

        let returns_float;
        if let Some(game_fn) = game_fn {
            returns_float = game_fn.return_type == Type::F32;
            let symbol = format!("{}{}", GAME_FN_PREFIX, fn_name);
            let offset = self.here();
            self.push_extern_fn_call(symbol, offset);
        } else if calls_helper_fn {
            returns_float = helper_returns_float;
            let symbol = helper_fn_mode_name(&fn_name, !self.fast_mode);
            let offset = self.here();
            self.out.helper_fn_calls.push(Reloc { name: symbol, offset });
        } else {
            bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
        }
        self.emit(PLACEHOLDER_32)?;

        // Put rsp back where nested expressions expect their intermediate
        // values to be
        let offset = (pushes + usize::from(requires_padding)) * 8;
        if offset > 0 {
            if offset < 0x80 {
                self.emit(ADD_RSP_8_BITS)?;
                self.emit8(offset as u8)?;
            } else {
                self.emit(ADD_RSP_32_BITS)?;
                self.emit32(offset as u32)?;
            }
            self.stack_frame_bytes += offset;
        }

        debug_assert!(self.pushed >= pushes);
        self.pushed -= pushes;

        if returns_float {
            self.emit(MOV_XMM0_TO_EAX)?;
        }

        if !self.fast_mode {
            if game_fn.is_some() {
                self.emit_check_game_fn_error()?;
            } else {
                self.emit_return_if_runtime_error()?;
            }
        }
        Ok(())
    }

    // ---- Statements ----

    fn compile_global_variable_store(&mut self, name: &str) -> Result<()> {
        self.emit(MOV_DEREF_RBP_TO_R11_8_BIT_OFFSET)?;
        self.emit8((GLOBAL_VARIABLES_POINTER_SIZE as u8).wrapping_neg())?;

        let Some(var) = self.globals.get(name) else {
            bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!");
        };
        let (ty, offset) = (var.ty, var.offset);
        let small = offset < 0x80;

        if ty == Type::Id {
            ensure!(
                !self.compiled_init_globals,
                "Global id variables can't be reassigned"
            );
        }

        let opcode = match (ty, small) {
            (Type::Bool, true) => MOV_AL_TO_DEREF_R11_8_BIT_OFFSET,
            (Type::Bool, false) => MOV_AL_TO_DEREF_R11_32_BIT_OFFSET,
            (Type::I32 | Type::F32, true) => MOV_EAX_TO_DEREF_R11_8_BIT_OFFSET,
            (Type::I32 | Type::F32, false) => MOV_EAX_TO_DEREF_R11_32_BIT_OFFSET,
            (Type::String | Type::Id, true) => MOV_RAX_TO_DEREF_R11_8_BIT_OFFSET,
            (Type::String | Type::Id, false) => MOV_RAX_TO_DEREF_R11_32_BIT_OFFSET,
            _ => bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!"),
        };
        self.emit(opcode)?;
        if small {
            self.emit8(offset as u8)?;
        } else {
            self.emit32(offset as u32)?;
        }
        Ok(())
    }

    fn compile_variable_statement(&mut self, var: &VariableStatement) -> Result<()> {
        self.compile_expr(&var.value)?;

        // Type propagation already rejected every invalid combination
        if let Some((ty, _)) = &var.declared_type {
            self.add_local(&var.name, *ty);
        }

        if let Some(local) = self.get_local(&var.name) {
            let (ty, offset) = (local.ty, local.offset);
            let small = offset <= 0x80;
            let opcode = match (ty, small) {
                (Type::Bool, true) => MOV_AL_TO_DEREF_RBP_8_BIT_OFFSET,
                (Type::Bool, false) => MOV_AL_TO_DEREF_RBP_32_BIT_OFFSET,
                (Type::I32 | Type::F32, true) => MOV_EAX_TO_DEREF_RBP_8_BIT_OFFSET,
                (Type::I32 | Type::F32, false) => MOV_EAX_TO_DEREF_RBP_32_BIT_OFFSET,
                (Type::String | Type::Id, true) => MOV_RAX_TO_DEREF_RBP_8_BIT_OFFSET,
                (Type::String | Type::Id, false) => MOV_RAX_TO_DEREF_RBP_32_BIT_OFFSET,
                _ => bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!"),
            };
            self.emit(opcode)?;
            if small {
                self.emit8((offset as u8).wrapping_neg())?;
            } else {
                self.emit32((offset as u32).wrapping_neg())?;
            }
            return Ok(());
        }

        self.compile_global_variable_store(&var.name)
    }

    fn compile_while_statement(&mut self, condition: &Expr, body: &[Statement]) -> Result<()> {
        let start = self.here();

        ensure!(
            self.loops.len() < MAX_LOOP_DEPTH,
            "There are more than {} while loops nested inside each other, exceeding the maximum",
            MAX_LOOP_DEPTH
        );
        self.loops.push(LoopFrame { start_offset: start, break_offsets: Vec::new() });

        self.compile_expr(condition)?;
        self.emit(TEST_AL_IS_ZERO)?;
        self.emit(JE_32_BIT_OFFSET)?;
        let end_jump = self.here();
        self.emit(PLACEHOLDER_32)?;

        self.compile_statements(body)?;

        if !self.fast_mode {
            self.emit_check_time_limit_exceeded()?;
        }

        self.emit8(JMP_32_BIT_OFFSET)?;
        let rel = start as i64 - (self.here() as i64 + NEXT_INSTRUCTION_OFFSET as i64);
        self.emit32(rel as u32)?;

        let here = self.here();
        self.overwrite_jmp32(end_jump, here);

        let frame = self.loops.pop().expect("loop frame pushed above");
        for break_offset in frame.break_offsets {
            self.overwrite_jmp32(break_offset, here);
        }
        Ok(())
    }

    fn compile_if_statement(
        &mut self,
        condition: &Expr,
        then_body: &[Statement],
        else_body: &[Statement],
    ) -> Result<()> {
        self.compile_expr(condition)?;
        self.emit(TEST_AL_IS_ZERO)?;
        self.emit(JE_32_BIT_OFFSET)?;
        let else_or_end_jump = self.here();
        self.emit(PLACEHOLDER_32)?;
        self.compile_statements(then_body)?;

        if !else_body.is_empty() {
            self.emit8(JMP_32_BIT_OFFSET)?;
            let skip_else_jump = self.here();
            self.emit(PLACEHOLDER_32)?;

            let here = self.here();
            self.overwrite_jmp32(else_or_end_jump, here);

            self.compile_statements(else_body)?;

            let here = self.here();
            self.overwrite_jmp32(skip_else_jump, here);
        } else {
            let here = self.here();
            self.overwrite_jmp32(else_or_end_jump, here);
        }
        Ok(())
    }

    fn compile_continue_statement(&mut self) -> Result<()> {
        ensure!(
            !self.loops.is_empty(),
            "There is a continue statement that isn't inside of a while loop"
        );
        if !self.fast_mode {
            self.emit_check_time_limit_exceeded()?;
        }
        self.emit8(JMP_32_BIT_OFFSET)?;
        let start = self.loops.last().expect("checked above").start_offset;
        let rel = start as i64 - (self.here() as i64 + NEXT_INSTRUCTION_OFFSET as i64);
        self.emit32(rel as u32)
    }

    fn compile_statements(&mut self, body: &[Statement]) -> Result<()> {
        for statement in body {
            match statement {
                Statement::Variable(var) => self.compile_variable_statement(var)?,
                Statement::Call(expr) => self.compile_call_expr(expr)?,
                Statement::If { condition, then_body, else_body } => {
                    self.compile_if_statement(condition, then_body, else_body)?;
                }
                Statement::Return(value) => {
                    if let Some(value) = value {
                        self.compile_expr(value)?;
                    }
                    self.emit_function_epilogue()?;
                }
                Statement::While { condition, body } => {
                    self.compile_while_statement(condition, body)?;
                }
                Statement::Break => {
                    ensure!(
                        !self.loops.is_empty(),
                        "There is a break statement that isn't inside of a while loop"
                    );
                    self.emit8(JMP_32_BIT_OFFSET)?;
                    let offset = self.here();
                    self.loops
                        .last_mut()
                        .expect("checked above")
                        .break_offsets
                        .push(offset);
                    self.emit(PLACEHOLDER_32)?;
                }
                Statement::Continue => self.compile_continue_statement()?,
                Statement::EmptyLine | Statement::Comment(_) => {}
            }
        }

        self.mark_scope_unreachable(body);
        Ok(())
    }

    // ---- Function frames ----

    /// High-water mark of simultaneously live locals, walked the same way
    /// the real compilation reclaims scopes.
    fn calc_max_local_variable_stack_usage(&mut self, body: &[Statement]) {
        for statement in body {
            match statement {
                Statement::Variable(var) => {
                    if let Some((ty, _)) = &var.declared_type {
                        self.stack_frame_bytes += ty.size();
                        if self.stack_frame_bytes > self.max_stack_frame_bytes {
                            self.max_stack_frame_bytes = self.stack_frame_bytes;
                        }
                    }
                }
                Statement::If { then_body, else_body, .. } => {
                    self.calc_max_local_variable_stack_usage(then_body);
                    if !else_body.is_empty() {
                        self.calc_max_local_variable_stack_usage(else_body);
                    }
                }
                Statement::While { body, .. } => {
                    self.calc_max_local_variable_stack_usage(body);
                }
                _ => {}
            }
        }

        for statement in body {
            if let Statement::Variable(var) = statement
                && let Some((ty, _)) = &var.declared_type
            {
                self.stack_frame_bytes -= ty.size();
            }
        }
    }

    /// Emit the safe-mode gate: load the mode byte through the GOT and
    /// `je` over the safe body when it is zero. Returns the rel32 offset to
    /// patch once the safe body (and its epilogue) is emitted.
    fn emit_safe_je(&mut self) -> Result<usize> {
        self.emit_global_load(MOV_GLOBAL_VARIABLE_TO_RAX, abi::global::ON_FNS_IN_SAFE_MODE)?;
        self.emit_padded(MOV_DEREF_RAX_TO_AL as u64, 2)?;
        self.emit(TEST_AL_IS_ZERO)?;
        self.emit(JE_32_BIT_OFFSET)?;
        let skip_safe_code = self.here();
        self.emit(PLACEHOLDER_32)?;
        Ok(skip_safe_code)
    }

    /// rdi holds the globals pointer on entry, but gets clobbered by the
    /// first call, so spill it to its fixed [rbp-8] slot.
    fn emit_move_globals_ptr(&mut self) -> Result<()> {
        self.emit(MOV_RDI_TO_DEREF_RBP_8_BIT_OFFSET)?;
        self.emit8((GLOBAL_VARIABLES_POINTER_SIZE as u8).wrapping_neg())
    }

    fn emit_function_prologue(&mut self) -> Result<()> {
        self.emit8(PUSH_RBP)?;
        self.emit(MOV_RSP_TO_RBP)?;

        // The System V ABI requires 16-byte stack alignment at calls
        self.max_stack_frame_bytes = self.max_stack_frame_bytes.div_ceil(16) * 16;

        if self.max_stack_frame_bytes < 0x80 {
            self.emit(SUB_RSP_8_BITS)?;
            self.emit8(self.max_stack_frame_bytes as u8)
        } else {
            self.emit(SUB_RSP_32_BITS)?;
            self.emit32(self.max_stack_frame_bytes as u32)
        }
    }

    fn add_argument_variables(&mut self, params: &[FnParam]) {
        self.locals.clear();
        self.local_index.clear();

        self.stack_frame_bytes = GLOBAL_VARIABLES_POINTER_SIZE;
        self.max_stack_frame_bytes = self.stack_frame_bytes;

        for param in params {
            self.add_local(&param.name, param.ty);
            self.max_stack_frame_bytes += param.ty.size();
        }
    }

    /// Spill the incoming register arguments into their frame slots; args
    /// past 6 integer / 8 float registers are read from the caller-pushed
    /// area starting at [rbp+0x10].
    fn move_arguments(&mut self, params: &[FnParam]) -> Result<()> {
        let mut integer_index = 0usize;
        let mut float_index = 0usize;

        // The return address and the pushed rbp sit between rbp and the
        // caller-pushed args
        let mut spill_offset = 0x10usize;

        const INTEGER_32_SMALL: [u64; 5] = [
            MOV_ESI_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_EDX_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_ECX_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_R8D_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_R9D_TO_DEREF_RBP_8_BIT_OFFSET,
        ];
        const INTEGER_32_BIG: [u64; 5] = [
            MOV_ESI_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_EDX_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_ECX_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_R8D_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_R9D_TO_DEREF_RBP_32_BIT_OFFSET,
        ];
        const INTEGER_64_SMALL: [u64; 5] = [
            MOV_RSI_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_RDX_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_RCX_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_R8_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_R9_TO_DEREF_RBP_8_BIT_OFFSET,
        ];
        const INTEGER_64_BIG: [u64; 5] = [
            MOV_RSI_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_RDX_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_RCX_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_R8_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_R9_TO_DEREF_RBP_32_BIT_OFFSET,
        ];
        const FLOAT_SMALL: [u64; 8] = [
            MOV_XMM0_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM1_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM2_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM3_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM4_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM5_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM6_TO_DEREF_RBP_8_BIT_OFFSET,
            MOV_XMM7_TO_DEREF_RBP_8_BIT_OFFSET,
        ];
        const FLOAT_BIG: [u64; 8] = [
            MOV_XMM0_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM1_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM2_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM3_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM4_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM5_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM6_TO_DEREF_RBP_32_BIT_OFFSET,
            MOV_XMM7_TO_DEREF_RBP_32_BIT_OFFSET,
        ];

        for param in params {
            let offset = self
                .get_local(&param.name)
                .expect("arguments were registered just before")
                .offset;
            let small = offset <= 0x80;

            match param.ty {
                Type::Bool | Type::I32 => {
                    // rdi/edi is taken by the secret globals pointer
                    if integer_index < 5 {
                        let table = if small { INTEGER_32_SMALL } else { INTEGER_32_BIG };
                        self.emit(table[integer_index])?;
                        self.emit_frame_offset(offset, small)?;
                        integer_index += 1;
                    } else {
                        self.emit(MOV_DEREF_RBP_TO_EAX_32_BIT_OFFSET)?;
                        self.emit32(spill_offset as u32)?;
                        spill_offset += 8;
                        self.emit(MOV_EAX_TO_DEREF_RBP_32_BIT_OFFSET)?;
                        self.emit32((offset as u32).wrapping_neg())?;
                    }
                }
                Type::F32 => {
                    if float_index < 8 {
                        let table = if small { FLOAT_SMALL } else { FLOAT_BIG };
                        self.emit(table[float_index])?;
                        self.emit_frame_offset(offset, small)?;
                        float_index += 1;
                    } else {
                        self.emit(MOV_DEREF_RBP_TO_EAX_32_BIT_OFFSET)?;
                        self.emit32(spill_offset as u32)?;
                        spill_offset += 8;
                        self.emit(MOV_EAX_TO_DEREF_RBP_32_BIT_OFFSET)?;
                        self.emit32((offset as u32).wrapping_neg())?;
                    }
                }
                Type::String | Type::Id => {
                    if integer_index < 5 {
                        let table = if small { INTEGER_64_SMALL } else { INTEGER_64_BIG };
                        self.emit(table[integer_index])?;
                        self.emit_frame_offset(offset, small)?;
                        integer_index += 1;
                    } else {
                        self.emit(MOV_DEREF_RBP_TO_RAX_32_BIT_OFFSET)?;
                        self.emit32(spill_offset as u32)?;
                        spill_offset += 8;
                        self.emit(MOV_RAX_TO_DEREF_RBP_32_BIT_OFFSET)?;
                        self.emit32((offset as u32).wrapping_neg())?;
                    }
                }
                _ => bail!("This line of code is supposed to be unreachable. Please report this bug to the grug developers!"),
            }
        }
        Ok(())
    }

    fn emit_frame_offset(&mut self, offset: usize, small: bool) -> Result<()> {
        if small {
            self.emit8((offset as u8).wrapping_neg())
        } else {
            self.emit32((offset as u32).wrapping_neg())
        }
    }

    // ---- Function bodies ----

    fn compile_on_fn(&mut self, fn_: &OnFn) -> Result<()> {
        self.add_argument_variables(&fn_.params);
        self.calc_max_local_variable_stack_usage(&fn_.body);

        self.emit_function_prologue()?;
        self.emit_move_globals_ptr()?;
        self.move_arguments(&fn_.params)?;

        let skip_safe_code = self.emit_safe_je()?;

        self.emit_save_fn_name_and_path(&fn_.name)?;

        if fn_.calls_helper_fn {
            // Record rsp - GRUG_STACK_LIMIT as the floor for this chain
            self.emit_system_fn_call(abi::import::GET_MAX_RSP_ADDR)?;
            self.emit(MOV_RSP_TO_DEREF_RAX)?;
            self.emit(SUB_DEREF_RAX_32_BITS)?;
            self.emit32(GRUG_STACK_LIMIT)?;
        }

        if fn_.calls_helper_fn || fn_.contains_while_loop {
            self.emit_system_fn_call(abi::import::SET_TIME_LIMIT)?;
        }

        self.emit_clear_has_runtime_error_happened()?;

        self.compile_statements(&fn_.body)?;
        debug_assert_eq!(self.pushed, 0);
        self.emit_function_epilogue()?;

        let here = self.here();
        self.overwrite_jmp32(skip_safe_code, here);

        // The fast body reuses the spilled arguments; its locals restart at
        // the same offsets, so re-register them
        self.reset_locals_for_second_body(&fn_.params);
        self.fast_mode = true;
        self.compile_statements(&fn_.body)?;
        debug_assert_eq!(self.pushed, 0);
        self.fast_mode = false;

        self.emit_function_epilogue()
    }

    fn reset_locals_for_second_body(&mut self, params: &[FnParam]) {
        self.locals.clear();
        self.local_index.clear();
        self.stack_frame_bytes = GLOBAL_VARIABLES_POINTER_SIZE;
        for param in params {
            self.add_local(&param.name, param.ty);
        }
    }

    fn compile_helper_fn(&mut self, fn_: &HelperFn) -> Result<()> {
        self.add_argument_variables(&fn_.params);
        self.calc_max_local_variable_stack_usage(&fn_.body);

        self.emit_function_prologue()?;
        self.emit_move_globals_ptr()?;
        self.move_arguments(&fn_.params)?;

        if !self.fast_mode {
            self.emit_check_stack_overflow()?;
            self.emit_check_time_limit_exceeded()?;
        }

        self.compile_statements(&fn_.body)?;
        debug_assert_eq!(self.pushed, 0);

        self.emit_function_epilogue()
    }

    fn compile_init_globals_fn(&mut self) -> Result<()> {
        let ast = self.ast;

        // "me" is always the first global: the entity id argument arrives
        // in rsi and is stored at offset 0
        if self.globals.vars().len() == 1 {
            self.emit(MOV_RSI_TO_DEREF_RDI)?;
            self.emit8(RET)?;
            self.compiled_init_globals = true;
            return Ok(());
        }

        self.locals.clear();
        self.local_index.clear();
        self.stack_frame_bytes = GLOBAL_VARIABLES_POINTER_SIZE;
        self.max_stack_frame_bytes = self.stack_frame_bytes;

        self.emit_function_prologue()?;
        self.emit_move_globals_ptr()?;
        self.emit(MOV_RSI_TO_DEREF_RDI)?;

        let skip_safe_code = self.emit_safe_je()?;

        self.emit_save_fn_name_and_path("init_globals")?;
        self.emit_clear_has_runtime_error_happened()?;

        for global in &ast.globals {
            self.compile_expr(&global.value)?;
            self.compile_global_variable_store(&global.name)?;
        }
        debug_assert_eq!(self.pushed, 0);
        self.emit_function_epilogue()?;

        let here = self.here();
        self.overwrite_jmp32(skip_safe_code, here);

        self.fast_mode = true;
        for global in &ast.globals {
            self.compile_expr(&global.value)?;
            self.compile_global_variable_store(&global.name)?;
        }
        debug_assert_eq!(self.pushed, 0);
        self.fast_mode = false;

        self.emit_function_epilogue()?;
        self.compiled_init_globals = true;
        Ok(())
    }

    fn compile_file(&mut self) -> Result<()> {
        let ast = self.ast;
        self.out.globals_bytes = self.globals.total_bytes;
        self.out.global_variables_count = self.globals.vars().len();

        let mut text_offset = 0usize;

        self.compile_init_globals_fn()?;
        self.out.text_offsets.push(text_offset);
        self.out.text_symbols.push(abi::export::INIT_GLOBALS.to_string());
        text_offset = self.here();

        for fn_ in &ast.on_fns {
            self.compile_on_fn(fn_)?;
            self.out.text_offsets.push(text_offset);
            self.out.text_symbols.push(fn_.name.clone());
            self.out.defined_on_fns.push(fn_.name.clone());
            text_offset = self.here();
        }

        for fn_ in &ast.helper_fns {
            let safe_name = helper_fn_mode_name(&fn_.name, true);
            self.out.helper_fn_offsets.insert(safe_name.clone(), self.here());
            self.compile_helper_fn(fn_)?;
            self.out.text_offsets.push(text_offset);
            self.out.text_symbols.push(safe_name);
            text_offset = self.here();

            let fast_name = helper_fn_mode_name(&fn_.name, false);
            self.out.helper_fn_offsets.insert(fast_name.clone(), self.here());
            self.fast_mode = true;
            self.compile_helper_fn(fn_)?;
            self.fast_mode = false;
            self.out.text_offsets.push(text_offset);
            self.out.text_symbols.push(fast_name);
            text_offset = self.here();

            self.out.helper_fns.push(fn_.name.clone());
        }

        debug_assert_eq!(self.out.entity_dependencies.len(), self.out.entity_types.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::parse_json;
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
                                "on_start": {"description": "called once"},
                                "on_tick": {
                                    "description": "per frame",
                                    "arguments": [{"name": "dt", "type": "f32"}]
                                }
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
                        "equip": {
                            "description": "equip an entity",
                            "arguments": [
                                {"name": "what", "type": "entity", "entity_type": "Weapon"}
                            ]
                        },
                        "trade": {
                            "description": "swap equipment",
                            "arguments": [
                                {"name": "give", "type": "entity", "entity_type": ""},
                                {"name": "take", "type": "entity", "entity_type": "Weapon"}
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

    fn compile_source(source: &str) -> ObjectCode {
        let api = test_api();
        let mut ast = parse(source).unwrap();
        let globals = fill_result_types(&mut ast, &api, "guns", "Greeter").unwrap();
        compile(&ast, &api, &globals, "mods/guns/hello-Greeter.grug", "guns", "mods").unwrap()
    }

    #[test]
    fn test_minimal_init_globals_shortcut() {
        let out = compile_source("on_start() {\n    noop()\n}\n");
        // mov [rdi], rsi is 48 89 37, then ret
        assert_eq!(&out.code[..4], &[0x48, 0x89, 0x37, 0xc3]);
        assert_eq!(out.globals_bytes, 8);
        assert_eq!(out.text_symbols[0], "init_globals");
        assert_eq!(out.text_offsets[0], 0);
        assert_eq!(out.text_offsets[1], 4);
    }

    #[test]
    fn test_on_fn_prologue_shape() {
        let out = compile_source("on_start() {\n    noop()\n}\n");
        let on_start = &out.code[out.text_offsets[1]..];
        // push rbp; mov rbp, rsp; sub rsp, 16
        assert_eq!(&on_start[..8], &[0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10]);
        // mov [rbp-8], rdi
        assert_eq!(&on_start[8..12], &[0x48, 0x89, 0x7d, 0xf8]);
    }

    #[test]
    fn test_game_fn_import_prefixed() {
        let out = compile_source("on_start() {\n    noop()\n}\n");
        assert!(out.used_extern_fns.contains(&"game_fn_noop".to_string()));
        // Safe-mode housekeeping imports come along
        assert!(out.used_extern_fns.contains(&"grug_call_runtime_error_handler".to_string()));
    }

    #[test]
    fn test_safe_mode_globals_referenced() {
        let out = compile_source("on_start() {\n    noop()\n}\n");
        let names: Vec<&str> =
            out.used_extern_globals.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"grug_on_fns_in_safe_mode"));
        assert!(names.contains(&"grug_has_runtime_error_happened"));
        assert!(names.contains(&"grug_fn_name"));
        assert!(names.contains(&"grug_fn_path"));
    }

    #[test]
    fn test_helper_emitted_twice() {
        let source = concat!(
            "on_start() {\n",
            "    helper_f()\n",
            "}\n",
            "\n",
            "helper_f() {\n",
            "    noop()\n",
            "}\n",
        );
        let out = compile_source(source);
        assert!(out.helper_fn_offsets.contains_key("helper_f_safe"));
        assert!(out.helper_fn_offsets.contains_key("helper_f_fast"));
        assert_eq!(
            out.text_symbols,
            vec!["init_globals", "on_start", "helper_f_safe", "helper_f_fast"]
        );

        // The safe variant begins with the stack overflow check, so it
        // calls grug_get_max_rsp; the fast variant must not
        let safe_start = out.helper_fn_offsets["helper_f_safe"];
        let fast_start = out.helper_fn_offsets["helper_f_fast"];
        let safe_len = fast_start - safe_start;
        let fast_len = out.code.len() - fast_start;
        assert!(safe_len > fast_len);
    }

    #[test]
    fn test_helper_call_records_mode_names() {
        let source = concat!(
            "on_start() {\n",
            "    helper_f()\n",
            "}\n",
            "\n",
            "helper_f() {\n",
            "    noop()\n",
            "}\n",
        );
        let out = compile_source(source);
        let names: Vec<&str> = out.helper_fn_calls.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"helper_f_safe"));
        assert!(names.contains(&"helper_f_fast"));
    }

    #[test]
    fn test_on_fn_arms_sandbox_only_when_needed() {
        let plain = compile_source("on_start() {\n    noop()\n}\n");
        assert!(!plain.used_extern_fns.contains(&"grug_set_time_limit".to_string()));
        assert!(!plain.used_extern_fns.contains(&"grug_get_max_rsp_addr".to_string()));

        let with_loop = compile_source(
            "on_start() {\n    while false {\n        noop()\n    }\n}\n",
        );
        assert!(with_loop.used_extern_fns.contains(&"grug_set_time_limit".to_string()));
        assert!(
            with_loop
                .used_extern_fns
                .contains(&"grug_is_time_limit_exceeded".to_string())
        );
        assert!(!with_loop.used_extern_fns.contains(&"grug_get_max_rsp_addr".to_string()));

        let with_helper = compile_source(concat!(
            "on_start() {\n",
            "    helper_f()\n",
            "}\n",
            "\n",
            "helper_f() {\n",
            "    noop()\n",
            "}\n",
        ));
        assert!(with_helper.used_extern_fns.contains(&"grug_get_max_rsp_addr".to_string()));
        assert!(with_helper.used_extern_fns.contains(&"grug_get_max_rsp".to_string()));
        assert!(with_helper.used_extern_fns.contains(&"grug_set_time_limit".to_string()));
    }

    #[test]
    fn test_resources_deduplicated() {
        let source = concat!(
            "on_start() {\n",
            "    play(\"foo.wav\")\n",
            "    play(\"foo.wav\")\n",
            "    play(\"bar.wav\")\n",
            "}\n",
        );
        let out = compile_source(source);
        assert_eq!(out.resources.len(), 2);
        let paths: Vec<&str> = out
            .resources
            .iter()
            .map(|&i| out.data_strings[i as usize].as_str())
            .collect();
        assert_eq!(paths, vec!["mods/guns/foo.wav", "mods/guns/bar.wav"]);
    }

    #[test]
    fn test_entities_keep_duplicates_with_types() {
        let source = concat!(
            "on_start() {\n",
            "    equip(\"swords:katana\")\n",
            "    trade(\"swords:katana\", \"swords:katana\")\n",
            "}\n",
        );
        let out = compile_source(source);
        assert_eq!(out.entity_dependencies.len(), 3);
        assert_eq!(out.entity_types.len(), 3);
        let types: Vec<&str> = out
            .entity_types
            .iter()
            .map(|&i| out.data_strings[i as usize].as_str())
            .collect();
        assert_eq!(types, vec!["Weapon", "", "Weapon"]);
    }

    #[test]
    fn test_bare_entity_name_qualified_with_mod() {
        let source = "on_start() {\n    equip(\"knife\")\n}\n";
        let out = compile_source(source);
        let name = &out.data_strings[out.entity_dependencies[0] as usize];
        assert_eq!(name, "guns:knife");
    }

    #[test]
    fn test_fast_body_skips_checks() {
        // With no helpers and no loops, an on_ fn's fast body is pure
        // arithmetic; its safe body must contain overflow checks (jno =
        // 0x71) while the section after the safe epilogue must not
        let source = "on_tick(dt: f32) {\n    x: i32 = 1 + 2\n    noop()\n}\n";
        let out = compile_source(source);
        let body = &out.code[out.text_offsets[1]..];
        let jno_count = body.iter().filter(|&&b| b == 0x71).count();
        assert!(jno_count >= 1, "safe body should carry a jno overflow check");
    }

    #[test]
    fn test_string_literals_interned_once() {
        let source = concat!(
            "on_start() {\n",
            "    s: string = \"hi\"\n",
            "    t: string = \"hi\"\n",
            "}\n",
        );
        let out = compile_source(source);
        assert_eq!(out.data_strings.iter().filter(|s| s.as_str() == "hi").count(), 1);
        // Both the safe and the fast body LEA it
        let index = out.data_string_index("hi").unwrap();
        let uses = out
            .data_string_relocs
            .iter()
            .filter(|(i, _)| *i == index)
            .count();
        assert_eq!(uses, 4);
    }

    #[test]
    fn test_globals_size_exported() {
        let source = "b: bool = true\nn: i32 = 5\n\non_start() {\n    noop()\n}\n";
        let out = compile_source(source);
        // me (8) + bool (1) + i32 (4)
        assert_eq!(out.globals_bytes, 13);
    }

    #[test]
    fn test_init_globals_full_form_has_safe_gate() {
        let source = "n: i32 = 5\n\non_start() {\n    noop()\n}\n";
        let out = compile_source(source);
        // The full init_globals loads grug_on_fns_in_safe_mode; the
        // shortcut form does not exist here
        let init_len = out.text_offsets[1];
        assert!(
            out.used_extern_globals
                .iter()
                .any(|r| r.name == "grug_on_fns_in_safe_mode" && r.offset < init_len)
        );
    }

    #[test]
    fn test_strcmp_used_for_string_equality() {
        let source = "on_start() {\n    b: bool = \"a\" == \"b\"\n}\n";
        let out = compile_source(source);
        assert!(out.used_extern_fns.contains(&"strcmp".to_string()));
    }

    #[test]
    fn test_while_true_compiles_with_backedge_check() {
        let source = "on_start() {\n    while true {\n        noop()\n    }\n}\n";
        let out = compile_source(source);
        // Two bodies, each with a back-edge; only the safe one polls the
        // deadline
        let time_calls = out
            .extern_fn_calls
            .iter()
            .filter(|r| r.name == "grug_is_time_limit_exceeded")
            .count();
        assert_eq!(time_calls, 1);
    }

    #[test]
    fn test_text_offsets_are_monotonic() {
        let source = concat!(
            "on_start() {\n",
            "    helper_a(1)\n",
            "}\n",
            "\n",
            "helper_a(n: i32) {\n",
            "    helper_b()\n",
            "}\n",
            "\n",
            "helper_b() {\n",
            "    noop()\n",
            "}\n",
        );
        let out = compile_source(source);
        assert_eq!(out.text_symbols.len(), out.text_offsets.len());
        for pair in out.text_offsets.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
