// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! The assembler. Source text is lexed into a [`arena::TokenArena`],
//! expanded by the [`preprocess::Preprocessor`], parsed into statements and
//! laid out by [`emit::emit`] into a [`Program`] plus [`DebugSymbols`].

pub mod arena;
pub mod emit;
pub mod error;
pub mod expr;
pub mod loader;
pub mod parse;
pub mod preprocess;
pub mod symbols;
pub mod token;

pub use error::{AsmError, Location, Trace};
pub use loader::{FsLoader, MemoryLoader, SourceLoader};
pub use symbols::{DebugSymbols, Entry, Symbol};

use tracing::info;

use crate::{memory::Memory, program::Program, value::DataType};
use arena::TokenArena;
use preprocess::Preprocessor;

/// The label the constant pool is placed at when a program defines it.
pub const DEFAULT_POOL_LABEL: &str = "__constants";

#[derive(Clone, Debug)]
pub struct AssemblerConfig {
    /// Type of operands left untyped by both the instruction and its
    /// opcode. `None` makes those an error.
    pub default_type: Option<DataType>,
    /// Label the constant pool starts at, when defined.
    pub pool_label: String,
    /// Address `.region` allocates downward from.
    pub region_base: u64,
    /// Fail instead of placing the pool after the program when
    /// `pool_label` is not defined.
    pub require_pool_anchor: bool,
    /// Log every macro expansion at `trace` level.
    pub trace_expansion: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            default_type: Some(DataType::I64),
            pool_label: DEFAULT_POOL_LABEL.into(),
            region_base: 1 << 24,
            require_pool_anchor: false,
            trace_expansion: false,
        }
    }
}

pub struct Assembler {
    pub config: AssemblerConfig,
    loader: Box<dyn SourceLoader>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}

impl Assembler {
    /// An assembler importing from the file system.
    pub fn new(config: AssemblerConfig) -> Self {
        Self::with_loader(config, Box::new(FsLoader::default()))
    }

    pub fn with_loader(
        config: AssemblerConfig,
        loader: Box<dyn SourceLoader>,
    ) -> Self {
        Self { config, loader }
    }

    /// Assembles `text`, known as `name` in diagnostics and for resolving
    /// relative imports.
    pub fn build(
        &mut self,
        name: &str,
        text: &str,
    ) -> Result<(Program, DebugSymbols), AsmError> {
        let mut arena = TokenArena::default();
        let tokens = arena.load(name, text);
        let expanded =
            Preprocessor::new(&mut arena, self.loader.as_mut(), &self.config)
                .run(tokens)?;
        let statements = parse::parse(&arena, &expanded)?;
        let emitted = emit::emit(&arena, &self.config, &statements)?;
        info!(
            source = name,
            bytes = emitted.program.len(),
            labels = emitted.labels.len(),
            "assembled"
        );
        let symbols = DebugSymbols::new(arena, emitted.labels, emitted.entries);
        Ok((emitted.program, symbols))
    }

    /// Assembles `text` and writes it into `memory`. On error `memory` is
    /// left untouched.
    pub fn assemble(
        &mut self,
        name: &str,
        text: &str,
        memory: &mut dyn Memory,
    ) -> Result<DebugSymbols, AsmError> {
        let (program, symbols) = self.build(name, text)?;
        program.write_to(memory);
        Ok(symbols)
    }
}

/// Assembles `text` with the default configuration into `memory`.
pub fn assemble(
    text: &str,
    memory: &mut dyn Memory,
) -> Result<DebugSymbols, AsmError> {
    Assembler::default().assemble("<input>", text, memory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instruction::Instruction,
        memory::Ram,
        value::Value,
        vm::{VmConfig, VM},
    };

    fn run(text: &str) -> (VM, DebugSymbols) {
        let mut vm = VM::new(VmConfig::default());
        let symbols = assemble(text, vm.memory_mut()).unwrap();
        vm.run(100);
        assert!(vm.is_halted());
        (vm, symbols)
    }

    #[test]
    fn typed_add_of_pooled_constants() {
        let (mut vm, symbols) = run("@0\nmain: add:u64 5, 3\nhalt\n");
        assert_eq!(Some(0), symbols.address_of("main"));
        assert_eq!(0xFFFFF8, vm.sp());
        assert_eq!(Value::from_u64(8), vm.read_value(vm.sp(), DataType::U64));
        assert_eq!(14, symbols.entries()[0].bytes.len());
    }

    #[test]
    fn untyped_operands_use_the_default_type() {
        let (mut vm, symbols) =
            run(".macro inc(x) { add x, 1 }\ninc(42)\nhalt\n");
        assert_eq!(Value::from_i64(43), vm.read_value(vm.sp(), DataType::I64));
        let add = symbols.instruction_at(0).unwrap();
        assert_eq!("add", symbols.arena().text(add));
        assert_eq!("inc(42)", symbols.origin_line(add));
    }

    #[test]
    fn regions_label_memory_below_the_base() {
        let (mut vm, symbols) = run(
            ".region stack 256\n.region buffer 16\n@0\npush:p24 buffer\nhalt\n",
        );
        assert_eq!(Some(0xFFFF00), symbols.address_of("stack"));
        assert_eq!(Some(0xFFFEF0), symbols.address_of("buffer"));
        assert_eq!(
            Value::from_u64(0xFFFEF0),
            vm.read_value(vm.sp(), DataType::P24)
        );
    }

    #[test]
    fn failed_assembly_writes_nothing() {
        let mut ram = Ram::with_size(64);
        let error = assemble("nop\njump nowhere\n", &mut ram).unwrap_err();
        assert!(matches!(
            error,
            AsmError::UnknownLabel { ref name, .. } if name == "nowhere"
        ));
        assert_eq!("<input>:2:6", error.trace().to_string());
        let mut bytes = [0xAA; 64];
        ram.read(0, &mut bytes);
        assert_eq!([0; 64], bytes);
    }

    #[test]
    fn macros_expand_into_runnable_code() {
        let mut loader = MemoryLoader::default();
        loader.insert("math.lanes", ".macro double(x) { mul:i32 x, 2 }\n");
        let mut assembler = Assembler::with_loader(
            AssemblerConfig::default(),
            Box::new(loader),
        );
        let mut vm = VM::new(VmConfig::default());
        let symbols = assembler
            .assemble(
                "main.lanes",
                ".import \"math.lanes\"\n\
                 start: .double(21)\ndebug:i32 _\nhalt\n",
                vm.memory_mut(),
            )
            .unwrap();
        vm.run(10);
        assert_eq!(vec!["42"], vm.take_debug_output());

        let mul = symbols.instruction_at(0).unwrap();
        assert_eq!(
            "math.lanes:1:20, expanded from main.lanes:2:8",
            symbols.trace(mul).to_string()
        );
        assert_eq!(Some(0), symbols.address_of("start"));
    }

    #[test]
    fn folded_widths_set_the_lane_count() {
        let (mut vm, symbols) = run("push:u8*.add(*2, *3) 1\nhalt\n");
        let bytes = &symbols.entries()[0].bytes;
        let word = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        assert_eq!(5, Instruction::decode(word).width);
        assert_eq!(0xFFFFFB, vm.sp());
        assert_eq!(
            Value::from_u64(1),
            vm.read_value(0xFFFFFF, DataType::U8)
        );
    }

    #[test]
    fn listing_covers_every_instruction() {
        let (_, symbols) = run("main: push:u8 1\npop:u8 _\nhalt\n");
        let listing = symbols.listing();
        assert!(listing.starts_with("main:\n000000"));
        assert_eq!(4, listing.lines().count());
        assert!(listing.lines().last().unwrap().ends_with("halt"));
    }
}
