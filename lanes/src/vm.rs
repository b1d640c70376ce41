// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use core::cmp::Ordering;

use rand_core::{OsRng, RngCore};

use crate::{
    arch::{
        mask, offset, Address, ADDRESS_BYTES, MAX_OPERANDS, MAX_WIDTH,
        WORD_BYTES,
    },
    instruction::Instruction,
    memory::{read_uint, write_uint, DeviceId, MappedMemory, Memory},
    op::Opcode,
    value::{DataType, Mode, ValArray, Value},
};

/// Sleep counter value that never counts down.
pub const HALTED: u64 = u64::MAX;

/// Bytes a saved `[fp, return address]` pair occupies on the stack.
pub const FRAME_BYTES: usize = 2 * ADDRESS_BYTES;

/// Largest operand in bytes: eight 8-byte lanes.
const OPERAND_BYTES: usize = MAX_WIDTH * 8;

#[derive(Clone, Debug)]
pub struct VmConfig {
    pub initial_pc: Address,
    /// The stack grows down from here; 0 puts the first push at the top of
    /// memory.
    pub initial_sp: Address,
    pub initial_fp: Address,
    /// Emit a `trace!` event per executed instruction.
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            initial_pc: 0,
            initial_sp: 0,
            initial_fp: 0,
            trace: false,
        }
    }
}

/// What a call to [`VM::step`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Executed(Opcode),
    /// The sleep counter was nonzero; nothing was fetched.
    Sleeping,
    Halted,
    /// The instruction was malformed and skipped.
    Skipped,
}

/// One operand vector plus where it lives.
#[derive(Clone, Copy, Default)]
struct Operand {
    array: ValArray,
    address: Address,
    stack: bool,
}

pub struct VM {
    memory: MappedMemory,
    pc: Address,
    fp: Address,
    sp: Address,
    sleep: u64,
    // scratch A/B/C operands, reused every step
    operands: [Operand; MAX_OPERANDS],
    rng: Box<dyn RngCore>,
    config: VmConfig,
    debug_output: Vec<String>,
}

impl Default for VM {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

impl VM {
    pub fn new(config: VmConfig) -> Self {
        Self::with_rng(config, Box::new(OsRng))
    }

    pub fn with_rng(config: VmConfig, rng: Box<dyn RngCore>) -> Self {
        Self {
            memory: MappedMemory::default(),
            pc: config.initial_pc,
            fp: config.initial_fp,
            sp: config.initial_sp,
            sleep: 0,
            operands: [Operand::default(); MAX_OPERANDS],
            rng,
            config,
            debug_output: vec![],
        }
    }

    /// Puts the registers back to their configured values. Memory and
    /// device mappings are left alone.
    pub fn reset(&mut self) {
        self.pc = self.config.initial_pc;
        self.fp = self.config.initial_fp;
        self.sp = self.config.initial_sp;
        self.sleep = 0;
        self.debug_output.clear();
    }

    pub fn memory(&self) -> &MappedMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MappedMemory {
        &mut self.memory
    }

    pub fn pc(&self) -> Address {
        self.pc
    }

    pub fn fp(&self) -> Address {
        self.fp
    }

    pub fn sp(&self) -> Address {
        self.sp
    }

    pub fn set_pc(&mut self, pc: Address) {
        self.pc = mask(pc as u64);
    }

    pub fn set_fp(&mut self, fp: Address) {
        self.fp = mask(fp as u64);
    }

    pub fn set_sp(&mut self, sp: Address) {
        self.sp = mask(sp as u64);
    }

    pub fn sleep(&self) -> u64 {
        self.sleep
    }

    /// Set to [`HALTED`] to stop the machine from the outside.
    pub fn set_sleep(&mut self, sleep: u64) {
        self.sleep = sleep;
    }

    pub fn is_halted(&self) -> bool {
        self.sleep == HALTED
    }

    /// Lines produced by `debug` and `dbgstr` since the last call.
    pub fn take_debug_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.debug_output)
    }

    /// Reads one lane of `ty` at `address`.
    pub fn read_value(&mut self, address: Address, ty: DataType) -> Value {
        let mut bytes = [0; 8];
        self.memory.read(address, &mut bytes[..ty.size()]);
        ty.decode(&bytes)
    }

    /// Steps at most `steps` times, stopping early once halted. Returns the
    /// number of steps taken.
    pub fn run(&mut self, steps: u64) -> u64 {
        for taken in 0..steps {
            if self.step() == Step::Halted {
                return taken;
            }
        }
        steps
    }

    pub fn step(&mut self) -> Step {
        if self.sleep == HALTED {
            return Step::Halted;
        }
        if self.sleep > 0 {
            self.sleep -= 1;
            return Step::Sleeping;
        }

        let start = self.pc;
        let word = read_uint(&mut self.memory, start, WORD_BYTES);
        let instruction = Instruction::decode(word);
        self.pc = offset(start, instruction.size() as i64);

        if self.config.trace {
            tracing::trace!(
                pc = start,
                sp = self.sp,
                fp = self.fp,
                "{:?}",
                instruction
            );
        }

        if !self.fetch_operands(start, &instruction) {
            tracing::warn!(
                pc = start,
                word,
                "skipping malformed instruction {:?}",
                instruction.opcode
            );
            return Step::Skipped;
        }

        self.execute(instruction.opcode);
        self.store_outputs(&instruction);
        Step::Executed(instruction.opcode)
    }

    /// Resolves every operand's type, width and address, pops stack inputs
    /// and reads all inputs. Returns `false` if the instruction cannot run.
    fn fetch_operands(
        &mut self,
        start: Address,
        instruction: &Instruction,
    ) -> bool {
        if instruction.opcode == Opcode::Invalid {
            return false;
        }
        let template = instruction.opcode.template();

        let mut immediate = offset(start, WORD_BYTES as i64);
        for slot in 0..MAX_OPERANDS {
            let ty = template.slots[slot].ty.unwrap_or(instruction.types[slot]);
            let width = template.slots[slot].width.unwrap_or(instruction.width);
            let operand = &mut self.operands[slot];
            operand.array.reset(ty, width);
            operand.stack = !instruction.is_immediate(slot);
            if instruction.is_immediate(slot) {
                operand.address = if instruction.is_inline(slot) {
                    immediate
                } else {
                    mask(read_uint(&mut self.memory, immediate, ADDRESS_BYTES))
                };
                immediate = offset(immediate, ADDRESS_BYTES as i64);
            }
            if slot < template.operands() && !ty.is_supported() {
                return false;
            }
        }

        // the last input is the top of the stack
        for slot in (0..template.inputs as usize).rev() {
            let operand = &mut self.operands[slot];
            if operand.stack {
                operand.address = self.sp;
                self.sp = offset(self.sp, operand.array.byte_len() as i64);
            }
        }

        let mut bytes = [0; OPERAND_BYTES];
        for slot in 0..template.inputs as usize {
            let operand = &mut self.operands[slot];
            let length = operand.array.byte_len();
            self.memory.read(operand.address, &mut bytes[..length]);
            operand.array.decode(&bytes);
        }
        true
    }

    fn store_outputs(&mut self, instruction: &Instruction) {
        let template = instruction.opcode.template();
        let mut bytes = [0; OPERAND_BYTES];
        for slot in template.inputs as usize..template.operands() {
            let operand = &mut self.operands[slot];
            let length = operand.array.byte_len();
            if operand.stack {
                self.sp = offset(self.sp, -(length as i64));
                operand.address = self.sp;
            }
            operand.array.encode(&mut bytes);
            self.memory.write(operand.address, &bytes[..length]);
        }
    }

    fn execute(&mut self, opcode: Opcode) {
        match opcode {
            Opcode::Nop | Opcode::Pop | Opcode::Invalid => {}
            Opcode::Halt => self.sleep = HALTED,

            Opcode::Push | Opcode::Tof | Opcode::Toi | Opcode::Tou => {
                self.unary(|_, value| value)
            }
            Opcode::Dup => {
                self.unary(|_, value| value);
                let copy = self.operands[1].array;
                let out = &mut self.operands[2].array;
                for lane in 0..out.width() {
                    let value = copy.lane(lane);
                    out.set(lane, out.mode().convert(value, copy.mode()));
                }
            }
            Opcode::Swz => {
                let (a, indices) =
                    (self.operands[0].array, self.operands[1].array);
                let out = &mut self.operands[2].array;
                for lane in 0..out.width() {
                    let index = indices.lane(lane).as_u64() as usize;
                    let value = a.lane(index % a.width().max(1));
                    out.set(lane, out.mode().convert(value, a.mode()));
                }
            }

            Opcode::Ld => {
                let address = self.address_operand(0);
                self.load(address, 1);
            }
            Opcode::Ldf => {
                let address = offset(self.fp, self.offset_operand(0));
                self.load(address, 1);
            }
            Opcode::Lds => {
                let address = offset(self.sp, self.offset_operand(0));
                self.load(address, 1);
            }
            Opcode::St => {
                let address = self.address_operand(1);
                self.store(address, 0);
            }
            Opcode::Stf => {
                let address = offset(self.fp, self.offset_operand(1));
                self.store(address, 0);
            }
            Opcode::Sts => {
                let address = offset(self.sp, self.offset_operand(1));
                self.store(address, 0);
            }

            Opcode::Getfp => {
                self.operands[0].array.set(0, Value::from_u64(self.fp as u64))
            }
            Opcode::Getsp => {
                self.operands[0].array.set(0, Value::from_u64(self.sp as u64))
            }
            Opcode::Setfp => self.fp = self.address_operand(0),
            Opcode::Setsp => self.sp = self.address_operand(0),
            Opcode::Addfp => self.fp = offset(self.fp, self.offset_operand(0)),
            Opcode::Addsp => self.sp = offset(self.sp, self.offset_operand(0)),

            Opcode::Not => self.unary(|mode, a| mode.not(a)),
            Opcode::Neg => self.unary(|mode, a| mode.neg(a)),
            Opcode::Abs => self.unary(|mode, a| mode.abs(a)),
            Opcode::Sign => self.unary(|mode, a| mode.sign(a)),

            Opcode::And => self.binary(|mode, a, b| mode.and(a, b)),
            Opcode::Or => self.binary(|mode, a, b| mode.or(a, b)),
            Opcode::Xor => self.binary(|mode, a, b| mode.xor(a, b)),
            Opcode::Shl => self.binary(|mode, a, b| mode.shl(a, b)),
            Opcode::Shr => self.binary(|mode, a, b| mode.shr(a, b)),
            Opcode::Add => self.binary(|mode, a, b| mode.add(a, b)),
            Opcode::Sub => self.binary(|mode, a, b| mode.sub(a, b)),
            Opcode::Mul => self.binary(|mode, a, b| mode.mul(a, b)),
            Opcode::Div => self.binary(|mode, a, b| mode.div(a, b)),
            Opcode::Mod => self.binary(|mode, a, b| mode.rem(a, b)),
            Opcode::Pow => self.binary(|mode, a, b| mode.pow(a, b)),
            Opcode::Min => self.binary(|mode, a, b| mode.min(a, b)),
            Opcode::Max => self.binary(|mode, a, b| mode.max(a, b)),

            Opcode::Rsum => self.reduce(|mode, a, b| mode.add(a, b)),
            Opcode::Rprod => self.reduce(|mode, a, b| mode.mul(a, b)),
            Opcode::Rmin => self.reduce(|mode, a, b| mode.min(a, b)),
            Opcode::Rmax => self.reduce(|mode, a, b| mode.max(a, b)),
            Opcode::Rall => self.reduce(|mode, a, b| mode.and(a, b)),
            Opcode::Rany => self.reduce(|mode, a, b| mode.or(a, b)),

            Opcode::Sqrt => self.float_unary(f64::sqrt),
            Opcode::Exp => self.float_unary(f64::exp),
            Opcode::Ln => self.float_unary(f64::ln),
            Opcode::Sin => self.float_unary(f64::sin),
            Opcode::Cos => self.float_unary(f64::cos),
            Opcode::Tan => self.float_unary(f64::tan),
            Opcode::Asin => self.float_unary(f64::asin),
            Opcode::Acos => self.float_unary(f64::acos),
            Opcode::Atan => self.float_unary(f64::atan),
            Opcode::Floor => self.float_unary(f64::floor),
            Opcode::Ceil => self.float_unary(f64::ceil),
            Opcode::Round => self.float_unary(f64::round),
            Opcode::Atan2 => self.binary(|mode, a, b| {
                mode.from_f64(mode.to_f64(a).atan2(mode.to_f64(b)))
            }),

            Opcode::Jump => self.pc = self.address_operand(0),
            Opcode::Jz => self.branch_on_sign(|ordering| {
                ordering == Some(Ordering::Equal)
            }),
            Opcode::Jnz => self.branch_on_sign(|ordering| {
                ordering != Some(Ordering::Equal)
            }),
            Opcode::Jneg => self.branch_on_sign(|ordering| {
                ordering == Some(Ordering::Less)
            }),
            Opcode::Jpos => self.branch_on_sign(|ordering| {
                ordering == Some(Ordering::Greater)
            }),
            Opcode::Jeq => self.branch_on_compare(|ordering| {
                ordering == Some(Ordering::Equal)
            }),
            Opcode::Jne => self.branch_on_compare(|ordering| {
                ordering != Some(Ordering::Equal)
            }),
            Opcode::Jlt => self.branch_on_compare(|ordering| {
                ordering == Some(Ordering::Less)
            }),
            Opcode::Jle => self.branch_on_compare(|ordering| {
                matches!(ordering, Some(Ordering::Less | Ordering::Equal))
            }),
            Opcode::Jgt => self.branch_on_compare(|ordering| {
                ordering == Some(Ordering::Greater)
            }),
            Opcode::Jge => self.branch_on_compare(|ordering| {
                matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
            }),
            Opcode::Switch => {
                let index = self.operands[0].array.lane(0).as_u64();
                let table = self.address_operand(1);
                let entry =
                    offset(table, (index * ADDRESS_BYTES as u64) as i64);
                self.pc =
                    mask(read_uint(&mut self.memory, entry, ADDRESS_BYTES));
            }
            Opcode::Call => {
                let target = self.address_operand(0);
                self.sp = offset(self.sp, -(FRAME_BYTES as i64));
                write_uint(
                    &mut self.memory,
                    self.sp,
                    self.fp as u64,
                    ADDRESS_BYTES,
                );
                write_uint(
                    &mut self.memory,
                    offset(self.sp, ADDRESS_BYTES as i64),
                    self.pc as u64,
                    ADDRESS_BYTES,
                );
                self.fp = self.sp;
                self.pc = target;
            }
            Opcode::Adjf => self.sp = offset(self.fp, -self.offset_operand(0)),
            Opcode::Ret => {
                self.sp = self.fp;
                self.fp =
                    mask(read_uint(&mut self.memory, self.sp, ADDRESS_BYTES));
                self.pc = mask(read_uint(
                    &mut self.memory,
                    offset(self.sp, ADDRESS_BYTES as i64),
                    ADDRESS_BYTES,
                ));
                self.sp = offset(self.sp, FRAME_BYTES as i64);
            }

            Opcode::Rand => {
                let out = &mut self.operands[0].array;
                let mode = out.mode();
                for lane in 0..out.width() {
                    out.set(lane, mode.random(self.rng.as_mut()));
                }
            }
            Opcode::Sleep => {
                self.sleep = self.operands[0].array.lane(0).as_u64()
            }
            Opcode::Devmap => {
                let device = self.operands[0].array.lane(0).as_u64() as usize;
                let address = self.address_operand(1);
                let length = self.operands[2].array.lane(0).as_u64() as u32;
                if !self.memory.map(address, DeviceId(device), 0, length) {
                    tracing::warn!(device, address, "no such device to map");
                }
            }
            Opcode::Debug => {
                let line = self.operands[0].array.format();
                self.emit_debug(line);
            }
            Opcode::Dbgstr => {
                let address = self.operands[0].address;
                let length = read_uint(&mut self.memory, address, 1) as usize;
                let mut text = vec![0; length];
                self.memory.read(offset(address, 1), &mut text);
                self.emit_debug(String::from_utf8_lossy(&text).into_owned());
            }
        }
    }

    fn emit_debug(&mut self, line: String) {
        tracing::info!(target: "lanes::debug", "{line}");
        self.debug_output.push(line);
    }

    fn address_operand(&self, slot: usize) -> Address {
        mask(self.operands[slot].array.lane(0).as_u64())
    }

    fn offset_operand(&self, slot: usize) -> i64 {
        self.operands[slot].array.lane(0).as_i64()
    }

    /// Reads the `slot` operand's lanes from `address`.
    fn load(&mut self, address: Address, slot: usize) {
        let mut bytes = [0; OPERAND_BYTES];
        let out = &mut self.operands[slot].array;
        self.memory.read(address, &mut bytes[..out.byte_len()]);
        out.decode(&bytes);
    }

    /// Writes the `slot` operand's lanes to `address`.
    fn store(&mut self, address: Address, slot: usize) {
        let mut bytes = [0; OPERAND_BYTES];
        let value = &self.operands[slot].array;
        let length = value.byte_len();
        value.encode(&mut bytes);
        self.memory.write(address, &bytes[..length]);
    }

    /// Operand 0 into operand 1, lane by lane, converting to the output's
    /// mode.
    fn unary(&mut self, f: impl Fn(Mode, Value) -> Value) {
        let a = self.operands[0].array;
        let mode = a.mode();
        let out = &mut self.operands[1].array;
        for lane in 0..out.width() {
            out.set(lane, out.mode().convert(f(mode, a.lane(lane)), mode));
        }
    }

    fn float_unary(&mut self, f: impl Fn(f64) -> f64) {
        self.unary(|mode, a| mode.from_f64(f(mode.to_f64(a))));
    }

    /// Operands 0 and 1 into operand 2, lane by lane.
    fn binary(&mut self, f: impl Fn(Mode, Value, Value) -> Value) {
        let (a, b) = (self.operands[0].array, self.operands[1].array);
        let mode = a.mode();
        let out = &mut self.operands[2].array;
        for lane in 0..out.width() {
            let value = f(mode, a.lane(lane), b.lane(lane));
            out.set(lane, out.mode().convert(value, mode));
        }
    }

    /// Folds every lane of operand 0 into lane 0 of operand 1.
    fn reduce(&mut self, f: impl Fn(Mode, Value, Value) -> Value) {
        let a = self.operands[0].array;
        let mode = a.mode();
        let folded = a.lanes()[1..]
            .iter()
            .fold(a.lane(0), |accumulator, value| f(mode, accumulator, *value));
        let out = &mut self.operands[1].array;
        out.set(0, out.mode().convert(folded, mode));
    }

    /// Branches to operand 1 when every lane of operand 0 compared to zero
    /// satisfies `taken`.
    fn branch_on_sign(&mut self, taken: impl Fn(Option<Ordering>) -> bool) {
        let a = self.operands[0].array;
        let mode = a.mode();
        if a.lanes()
            .iter()
            .all(|value| taken(mode.compare(*value, Value::ZERO)))
        {
            self.pc = self.address_operand(1);
        }
    }

    /// Branches to operand 2 when every lane pair of operands 0 and 1
    /// satisfies `taken`.
    fn branch_on_compare(&mut self, taken: impl Fn(Option<Ordering>) -> bool) {
        let (a, b) = (self.operands[0].array, self.operands[1].array);
        let mode = a.mode();
        let lanes = a.width().max(b.width());
        if (0..lanes)
            .all(|lane| taken(mode.compare(a.lane(lane), b.lane(lane))))
        {
            self.pc = self.address_operand(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ADDRESS_MASK;

    /// Writes `instruction` and its immediates at `at`, returning the
    /// address after it.
    fn emit(
        vm: &mut VM,
        at: Address,
        instruction: Instruction,
        immediates: &[Address],
    ) -> Address {
        let mut instruction = instruction;
        instruction.imm_count = immediates.len() as u8;
        write_uint(vm.memory_mut(), at, instruction.encode(), WORD_BYTES);
        for (i, immediate) in immediates.iter().enumerate() {
            write_uint(
                vm.memory_mut(),
                at + (WORD_BYTES + i * ADDRESS_BYTES) as Address,
                *immediate as u64,
                ADDRESS_BYTES,
            );
        }
        at + instruction.size() as Address
    }

    fn typed(
        opcode: Opcode,
        ty: DataType,
        width: u8,
        immediate: u8,
    ) -> Instruction {
        let mut instruction = Instruction::new(opcode, width);
        instruction.types = [ty; MAX_OPERANDS];
        instruction.immediate = immediate;
        instruction
    }

    fn write_u64(vm: &mut VM, address: Address, value: u64) {
        write_uint(vm.memory_mut(), address, value, 8);
    }

    #[test]
    fn add_pushes_its_result() {
        let mut vm = VM::default();
        write_u64(&mut vm, 0x100, 5);
        write_u64(&mut vm, 0x108, 3);
        let add = typed(Opcode::Add, DataType::U64, 1, 0b011);
        emit(&mut vm, 0, add, &[0x100, 0x108]);

        assert_eq!(Step::Executed(Opcode::Add), vm.step());
        assert_eq!(ADDRESS_MASK - 7, vm.sp());
        assert_eq!(8, vm.read_value(vm.sp(), DataType::U64).as_u64());
        assert_eq!(14, vm.pc());
    }

    #[test]
    fn stack_inputs_pop_last_operand_first() {
        let mut vm = VM::default();
        let sp = 0x1000;
        vm.set_sp(sp - 16);
        // a = 10 pushed first, b = 4 on top
        write_u64(&mut vm, sp - 8, 10);
        write_u64(&mut vm, sp - 16, 4);
        emit(&mut vm, 0, typed(Opcode::Sub, DataType::I64, 1, 0), &[]);

        vm.step();
        assert_eq!(sp - 8, vm.sp());
        assert_eq!(6, vm.read_value(sp - 8, DataType::I64).as_i64());
    }

    #[test]
    fn lanes_compute_independently() {
        let mut vm = VM::default();
        for lane in 0..4 {
            write_uint(vm.memory_mut(), 0x200 + lane, lane as u64 + 1, 1);
        }
        for lane in 0..4 {
            write_uint(vm.memory_mut(), 0x300 + lane, 10, 1);
        }
        let mul = typed(Opcode::Mul, DataType::U8, 4, 0b111);
        emit(&mut vm, 0, mul, &[0x200, 0x300, 0x400]);

        vm.step();
        assert_eq!(0x281e140a, read_uint(vm.memory_mut(), 0x400, 4));
    }

    #[test]
    fn reductions_fold_to_one_lane() {
        let mut vm = VM::default();
        for lane in 0..3u32 {
            write_uint(vm.memory_mut(), 0x200 + 2 * lane, 7 + lane as u64, 2);
        }
        let rsum = typed(Opcode::Rsum, DataType::U16, 3, 0b11);
        emit(&mut vm, 0, rsum, &[0x200, 0x300]);

        vm.step();
        assert_eq!(24, read_uint(vm.memory_mut(), 0x300, 2));
        assert_eq!(0, read_uint(vm.memory_mut(), 0x302, 2));
    }

    #[test]
    fn call_then_ret_restores_pc_and_fp() {
        for (fp, sp) in [(0, 0), (0x1234, 0x8000), (ADDRESS_MASK, 2), (7, 7)] {
            let mut vm = VM::default();
            vm.set_fp(fp);
            vm.set_sp(sp);
            let mut call = typed(Opcode::Call, DataType::P24, 1, 0b1);
            call.inline = 0b1;
            let after_call = emit(&mut vm, 0x40, call, &[0x500]);
            emit(&mut vm, 0x500, Instruction::new(Opcode::Ret, 1), &[]);
            vm.set_pc(0x40);

            vm.step();
            assert_eq!(0x500, vm.pc());
            assert_eq!(vm.sp(), vm.fp());
            vm.step();
            assert_eq!(after_call, vm.pc());
            assert_eq!(fp, vm.fp());
            assert_eq!(sp, vm.sp());
        }
    }

    #[test]
    fn frame_relative_access_reads_below_fp() {
        let mut vm = VM::default();
        vm.set_fp(0x900);
        write_uint(vm.memory_mut(), 0x8fc, 0xdead, 4);
        write_uint(vm.memory_mut(), 0x100, (-4i32) as u32 as u64, 4);
        emit(&mut vm, 0, typed(Opcode::Ldf, DataType::U32, 1, 0b1), &[0x100]);

        vm.step();
        assert_eq!(0xdead, vm.read_value(vm.sp(), DataType::U32).as_u64());
    }

    #[test]
    fn stores_wrap_around_the_address_space() {
        let mut vm = VM::default();
        write_uint(vm.memory_mut(), 0x100, 0xbbaa, 2);
        let mut st = typed(Opcode::St, DataType::U16, 1, 0b11);
        st.inline = 0b10;
        let at = emit(&mut vm, 0, st, &[0x100, ADDRESS_MASK]);
        emit(&mut vm, at, Instruction::new(Opcode::Halt, 1), &[]);

        vm.run(10);
        assert!(vm.is_halted());
        assert_eq!(0xaa, read_uint(vm.memory_mut(), ADDRESS_MASK, 1));
        assert_eq!(0xbb, read_uint(vm.memory_mut(), 0, 1));
    }

    #[test]
    fn branches_need_every_lane() {
        let mut vm = VM::default();
        write_uint(vm.memory_mut(), 0x100, 0x0001, 2);
        let mut jz = typed(Opcode::Jz, DataType::U8, 2, 0b11);
        jz.inline = 0b10;
        emit(&mut vm, 0, jz, &[0x100, 0x700]);

        vm.step();
        assert_eq!(14, vm.pc());

        write_uint(vm.memory_mut(), 0x100, 0, 2);
        vm.set_pc(0);
        vm.step();
        assert_eq!(0x700, vm.pc());
    }

    #[test]
    fn malformed_instructions_are_skipped() {
        let mut vm = VM::default();
        write_uint(vm.memory_mut(), 0, 0x7f, WORD_BYTES);
        let mut bad_type = typed(Opcode::Add, DataType::Unsupported, 1, 0);
        bad_type.types[2] = DataType::U8;
        emit(&mut vm, 8, bad_type, &[]);

        assert_eq!(Step::Skipped, vm.step());
        assert_eq!(8, vm.pc());
        assert_eq!(Step::Skipped, vm.step());
        assert_eq!(16, vm.pc());
        assert_eq!(0, vm.sp());
    }

    #[test]
    fn sleep_suspends_fetching() {
        let mut vm = VM::default();
        write_uint(vm.memory_mut(), 0x100, 2, 4);
        emit(&mut vm, 0, typed(Opcode::Sleep, DataType::U32, 1, 0b1), &[0x100]);

        assert_eq!(Step::Executed(Opcode::Sleep), vm.step());
        assert_eq!(Step::Sleeping, vm.step());
        assert_eq!(Step::Sleeping, vm.step());
        // zeroed memory decodes as `nop`
        assert_eq!(Step::Executed(Opcode::Nop), vm.step());
    }

    #[test]
    fn devmap_routes_to_attached_device() {
        let mut vm = VM::default();
        let device = vm
            .memory_mut()
            .attach(Box::new(crate::memory::Ram::with_size(16)));
        write_uint(vm.memory_mut(), 0x100, device.0 as u64, 4);
        write_uint(vm.memory_mut(), 0x104, 8, 3);
        let mut devmap = typed(Opcode::Devmap, DataType::U32, 1, 0b111);
        devmap.inline = 0b010;
        let at = emit(&mut vm, 0, devmap, &[0x100, 0x4000, 0x104]);
        let mut st = typed(Opcode::St, DataType::U8, 1, 0b11);
        st.inline = 0b10;
        write_uint(vm.memory_mut(), 0x108, 0x5a, 1);
        emit(&mut vm, at, st, &[0x108, 0x4002]);

        vm.run(2);
        assert_eq!(0x5a, read_uint(vm.memory_mut(), 0x4002, 1));
        let mut underneath = [0; 1];
        vm.memory_mut().ram_mut().read(0x4002, &mut underneath);
        assert_eq!([0], underneath);
    }

    #[test]
    fn debug_formats_lanes() {
        let mut vm = VM::default();
        write_uint(vm.memory_mut(), 0x100, 0xff02, 2);
        let debug = typed(Opcode::Debug, DataType::I8, 2, 0b1);
        emit(&mut vm, 0, debug, &[0x100]);
        write_uint(vm.memory_mut(), 0x200, 2, 1);
        vm.memory_mut().write(0x201, b"hi");
        let dbgstr = typed(Opcode::Dbgstr, DataType::U8, 1, 0b1);
        emit(&mut vm, 11, dbgstr, &[0x200]);

        vm.run(2);
        assert_eq!(vec!["[2, -1]", "hi"], vm.take_debug_output());
    }

    struct Counter(u64);

    impl RngCore for Counter {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0 += 1;
            self.0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(
            &mut self,
            dest: &mut [u8],
        ) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn rand_fills_every_lane() {
        let mut vm = VM::with_rng(VmConfig::default(), Box::new(Counter(0)));
        emit(&mut vm, 0, typed(Opcode::Rand, DataType::U8, 3, 0b1), &[0x100]);

        vm.step();
        assert_eq!(0x030201, read_uint(vm.memory_mut(), 0x100, 3));
    }
}
