use std::collections::HashMap;
use std::mem;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::error::{VmError, VmResult};
use crate::image::{parse_translation_lines, BinaryImage, StringRef};
use crate::interpolate;
use crate::opcodes::{read_f64, read_i32, Opcode};
use crate::registry::FunctionRegistry;
use crate::value::Value;

/// Decides whether a chance-gated choice is offered.
/// Receives the VM's RNG and the normalized chance value.
pub type ChanceCallback = Box<dyn FnMut(&mut StdRng, f64) -> bool>;

/// Picks a continuation index from an ordered weight list.
pub type WeightedChanceCallback = Box<dyn FnMut(&mut StdRng, &[f64]) -> usize>;

/// A local slot: a plain value, a flag binding, or an empty tombstone.
/// Flag bindings are appended by the scene/function preamble; reads and
/// writes on a bound slot route through the persistent flag store.
/// Slot ids are fixed at compile time, so freeing a slot empties it in
/// place rather than renumbering the ones after it.
#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Value(Value),
    Flag(String),
}

#[derive(Debug, Clone, Default)]
struct Locals {
    slots: Vec<Slot>,
}

impl Locals {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.slots.clear();
    }

    #[cfg(test)]
    fn flag_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Flag(_)))
            .count()
    }

    /// Store into a plain slot, padding with empty slots past the end.
    /// The caller routes flag-bound slots to the flag store instead.
    fn set_value(&mut self, index: usize, value: Value) {
        if index < self.slots.len() {
            self.slots[index] = Slot::Value(value);
        } else {
            while self.slots.len() < index {
                self.slots.push(Slot::Empty);
            }
            self.slots.push(Slot::Value(value));
        }
    }

    /// Empty a slot in place; ids of the slots after it are unchanged
    fn free(&mut self, index: usize) {
        self.slots[index] = Slot::Empty;
    }
}

/// A saved activation: where to continue, and the caller's stack and locals
struct Frame {
    ip: usize,
    stack: Vec<Value>,
    locals: Locals,
}

struct ChoiceEntry {
    target: usize,
    text: String,
}

/// What a single executed instruction did to control flow
enum Flow {
    /// Keep going
    Normal,
    /// A suspension flag was raised; the host takes over
    Suspend,
    /// The activation at the call-stack floor exited
    Halt,
}

/// The DNX virtual machine
///
/// Executes one instruction per `update()` call and yields control to
/// the host at text, choice and completion suspension points. Generic
/// over the host's [`FunctionRegistry`], which carries every
/// application-specific operation.
pub struct Interpreter<R: FunctionRegistry> {
    image: BinaryImage,
    registry: R,

    rng: StdRng,
    chance_cb: ChanceCallback,
    weighted_cb: WeightedChanceCallback,

    ip: usize,
    stack: Vec<Value>,
    save: Value,
    locals: Locals,
    call_stack: Vec<Frame>,

    choices: Vec<ChoiceEntry>,
    choose_options: Vec<(f64, usize)>,

    paused: bool,
    in_choice: bool,
    select_choice: bool,
    running_text: bool,
    scene_completed: bool,

    current_text: String,
    current_scene: Option<String>,

    globals: HashMap<String, Value>,
    flags: HashMap<String, Value>,
    definitions_cache: HashMap<u32, String>,
}

impl<R: FunctionRegistry> Interpreter<R> {
    /// Construct a paused VM over a loaded image.
    ///
    /// The default chance callback accepts iff `d == 1` or
    /// `uniform(0,1) < d`; the default weighted callback samples
    /// `uniform(0, sum)` and selects by cumulative threshold. Both draw
    /// from the VM's own RNG, so `seed_rng` pins every outcome.
    pub fn new(image: BinaryImage, registry: R) -> Self {
        Interpreter {
            image,
            registry,
            rng: StdRng::from_entropy(),
            chance_cb: Box::new(|rng, d| d == 1.0 || rng.gen::<f64>() < d),
            weighted_cb: Box::new(|rng, weights| {
                let sum: f64 = weights.iter().sum();
                let sample = rng.gen::<f64>() * sum;
                let mut acc = 0.0;
                for (i, w) in weights.iter().enumerate() {
                    acc += w;
                    if sample < acc {
                        return i;
                    }
                }
                weights.len().saturating_sub(1)
            }),
            ip: 0,
            stack: Vec::with_capacity(32),
            save: Value::Undefined,
            locals: Locals::default(),
            call_stack: Vec::new(),
            choices: Vec::new(),
            choose_options: Vec::new(),
            paused: true,
            in_choice: false,
            select_choice: false,
            running_text: false,
            scene_completed: false,
            current_text: String::new(),
            current_scene: None,
            globals: HashMap::new(),
            flags: HashMap::new(),
            definitions_cache: HashMap::new(),
        }
    }

    /// Reseed the VM's RNG for deterministic runs
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Replace the chance predicate used by `ChoiceAdd`/`ChoiceAddTruthy`
    pub fn set_chance_callback(&mut self, cb: ChanceCallback) {
        self.chance_cb = cb;
    }

    /// Replace the weighted selector used by `ChooseSel`
    pub fn set_weighted_callback(&mut self, cb: WeightedChanceCallback) {
        self.weighted_cb = cb;
    }

    // -- Host API ------------------------------------------------------

    /// Begin a scene: evaluate its flag preamble, position the
    /// instruction pointer at the entry and unpause.
    pub fn run_scene(&mut self, name: &str) -> VmResult<()> {
        let symbol = self.image.symbol(name).ok_or_else(|| VmError::Lookup {
            kind: "scene",
            name: name.to_string(),
        })?;
        let offsets = self
            .image
            .scenes
            .get(&symbol)
            .cloned()
            .ok_or_else(|| VmError::Lookup {
                kind: "scene",
                name: name.to_string(),
            })?;
        if offsets.is_empty() {
            return Err(VmError::load(format!("scene '{}' has no entry offset", name)));
        }

        self.stack.clear();
        self.call_stack.clear();
        self.locals.clear();
        self.choices.clear();
        self.choose_options.clear();
        self.save = Value::Undefined;
        self.in_choice = false;
        self.select_choice = false;
        self.running_text = false;
        self.scene_completed = false;
        self.current_text.clear();
        self.current_scene = Some(name.to_string());

        debug!(scene = name, "entering scene");
        self.run_flag_preamble(&offsets)?;
        self.ip = Self::entry_ip(offsets[0])?;
        self.paused = false;
        Ok(())
    }

    /// Execute exactly one instruction, or return immediately when paused
    pub fn update(&mut self) -> VmResult<()> {
        if self.paused {
            return Ok(());
        }
        match self.step(0)? {
            Flow::Normal | Flow::Suspend => Ok(()),
            Flow::Halt => {
                self.scene_completed = true;
                self.paused = true;
                debug!(scene = ?self.current_scene, "scene completed");
                Ok(())
            }
        }
    }

    /// Acknowledge a text line: clears `running_text` and unpauses
    /// unless a choice selection is still pending.
    pub fn resume(&mut self) {
        self.running_text = false;
        if !self.select_choice {
            self.paused = false;
        }
    }

    /// Select a pending choice by index and continue at its target
    pub fn choose_choice(&mut self, index: usize) -> VmResult<()> {
        if !self.select_choice {
            return Err(VmError::state("no choice selection is pending"));
        }
        let target = self
            .choices
            .get(index)
            .map(|c| c.target)
            .ok_or(VmError::Bounds {
                what: "choice",
                index: index as i64,
                len: self.choices.len(),
            })?;
        self.ip = target;
        self.select_choice = false;
        self.in_choice = false;
        self.choices.clear();
        self.paused = false;
        Ok(())
    }

    /// Read a persistent flag
    pub fn get_flag(&self, name: &str) -> Option<Value> {
        self.flags.get(name).cloned()
    }

    /// Write a persistent flag
    pub fn set_flag(&mut self, name: &str, value: Value) {
        self.flags.insert(name.to_string(), value);
    }

    /// Read a persistent global
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Write a persistent global
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Load a translation file from disk, replacing the translation
    /// table and invalidating the definitions cache.
    pub fn load_translation_file(&mut self, path: impl AsRef<std::path::Path>) -> VmResult<()> {
        let text = std::fs::read_to_string(path)?;
        self.load_translations_from(&text)
    }

    /// Replace the translation table from already-read file text
    pub fn load_translations_from(&mut self, text: &str) -> VmResult<()> {
        self.image.translation_table = parse_translation_lines(text);
        self.image.translation_loaded = true;
        self.definitions_cache.clear();
        Ok(())
    }

    /// Resolve a named string definition, interpolating its argument
    /// fragment when one is present. Results are cached per symbol once
    /// translations are loaded.
    pub fn get_definition(&mut self, name: &str) -> VmResult<String> {
        let symbol = self.image.symbol(name).ok_or_else(|| VmError::Lookup {
            kind: "definition",
            name: name.to_string(),
        })?;
        if let Some(cached) = self.definitions_cache.get(&symbol) {
            return Ok(cached.clone());
        }
        let def = self
            .image
            .definitions
            .get(&symbol)
            .cloned()
            .ok_or_else(|| VmError::Lookup {
                kind: "definition",
                name: name.to_string(),
            })?;

        let template = match def.resolve_ref() {
            StringRef::Internal(id) => self.image.string(id)?.to_string(),
            StringRef::Translation(id) => {
                if !self.image.translation_loaded {
                    warn!(definition = name, "resolving a dialogue definition before translations are loaded");
                }
                self.image.translation(id)?.to_string()
            }
        };

        let rendered = match def.bytecode_offset {
            None => interpolate::render(&template, &[]),
            Some(offset) => {
                let mut args = self.run_fragment(offset as usize)?;
                // the value on top of the fragment's stack substitutes {0}
                args.reverse();
                interpolate::render(&template, &args)
            }
        };

        if self.image.translation_loaded {
            self.definitions_cache.insert(symbol, rendered.clone());
        }
        Ok(rendered)
    }

    // -- Observables ---------------------------------------------------

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn running_text(&self) -> bool {
        self.running_text
    }

    pub fn select_choice(&self) -> bool {
        self.select_choice
    }

    pub fn in_choice(&self) -> bool {
        self.in_choice
    }

    pub fn scene_completed(&self) -> bool {
        self.scene_completed
    }

    /// The dialogue line raised by the last `TextRun`
    pub fn current_text(&self) -> &str {
        &self.current_text
    }

    /// Name of the running (or just-completed) scene
    pub fn current_scene(&self) -> Option<&str> {
        self.current_scene.as_deref()
    }

    /// Texts of the pending choices, in emission order
    pub fn choices(&self) -> Vec<&str> {
        self.choices.iter().map(|c| c.text.as_str()).collect()
    }

    /// Current byte offset into the instruction stream
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Shared read access to the loaded image
    pub fn image(&self) -> &BinaryImage {
        &self.image
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &[Value] {
        &self.stack
    }

    #[cfg(test)]
    pub(crate) fn flag_binding_count(&self) -> usize {
        self.locals.flag_count()
    }

    #[cfg(test)]
    pub(crate) fn local_count(&self) -> usize {
        self.locals.len()
    }

    // -- Flag preamble and fragments -----------------------------------

    /// Evaluate the (default-value, flag-name) offset pairs of a scene
    /// or function, populate the persistent flag store under
    /// first-write-wins semantics, and append one flag binding per pair.
    fn run_flag_preamble(&mut self, offsets: &[i32]) -> VmResult<()> {
        for pair in offsets[1..].chunks_exact(2) {
            let default = self.run_fragment_single(Self::entry_ip(pair[0])?)?;
            let name = self.run_fragment_single(Self::entry_ip(pair[1])?)?;
            let name = name.as_str()?.to_string();
            self.flags.entry(name.clone()).or_insert(default);
            self.locals.slots.push(Slot::Flag(name));
        }
        Ok(())
    }

    /// Run a fragment and pop its single result
    fn run_fragment_single(&mut self, offset: usize) -> VmResult<Value> {
        let mut stack = self.run_fragment(offset)?;
        stack.pop().ok_or(VmError::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }

    /// Run a self-contained sub-execution from `offset` until its
    /// activation exits, returning the final operand stack. The outer
    /// `ip`, stack, pause state and locals are saved and restored —
    /// fragments still see the locals while they run, so flag defaults
    /// may read arguments, but any mutation (including the clear done
    /// by their terminating `Exit`) is discarded. Fragments must not
    /// suspend.
    fn run_fragment(&mut self, offset: usize) -> VmResult<Vec<Value>> {
        let saved_ip = self.ip;
        let saved_stack = mem::take(&mut self.stack);
        let saved_paused = self.paused;
        let saved_locals = self.locals.clone();
        let base = self.call_stack.len();
        self.ip = offset;

        let result = loop {
            match self.step(base) {
                Ok(Flow::Normal) => continue,
                Ok(Flow::Halt) => break Ok(mem::take(&mut self.stack)),
                Ok(Flow::Suspend) => {
                    break Err(VmError::state("sub-execution attempted to suspend"))
                }
                Err(e) => break Err(e),
            }
        };

        if result.is_err() {
            // drop any frames the fragment left behind and clear
            // suspension state it may have leaked
            self.call_stack.truncate(base);
            self.running_text = false;
            self.select_choice = false;
        }

        self.stack = saved_stack;
        self.ip = saved_ip;
        self.paused = saved_paused;
        self.locals = saved_locals;
        result
    }

    fn entry_ip(offset: i32) -> VmResult<usize> {
        usize::try_from(offset).map_err(|_| {
            VmError::load(format!("negative bytecode offset {}", offset))
        })
    }

    // -- Execution core ------------------------------------------------

    /// Decode and execute the instruction at `ip`. `base` is the
    /// call-stack floor of the current activation: `Exit` at the floor
    /// halts instead of popping a frame.
    fn step(&mut self, base: usize) -> VmResult<Flow> {
        let op_ip = self.ip;
        let byte = *self
            .image
            .instructions
            .get(op_ip)
            .ok_or(VmError::Bounds {
                what: "instruction",
                index: op_ip as i64,
                len: self.image.instructions.len(),
            })?;
        let opcode = Opcode::from_u8(byte)
            .map_err(|_| VmError::load(format!("unknown opcode 0x{:02x} at ip {}", byte, op_ip)))?;
        self.ip = op_ip + 1;

        self.exec(opcode, base).map_err(|e| e.at(opcode, op_ip))
    }

    fn exec(&mut self, opcode: Opcode, base: usize) -> VmResult<Flow> {
        match opcode {
            Opcode::Nop => {}

            // -- Stack shuffling --
            Opcode::Save => {
                self.save = self.peek()?.clone();
            }
            Opcode::Load => {
                self.stack.push(self.save.clone());
            }
            Opcode::PushUndefined => {
                self.stack.push(Value::Undefined);
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Duplicate => {
                let top = self.peek()?.clone();
                self.stack.push(top);
            }
            Opcode::Duplicate2 => {
                if self.stack.len() < 2 {
                    return Err(VmError::StackUnderflow {
                        needed: 2,
                        available: self.stack.len(),
                    });
                }
                let b = self.stack[self.stack.len() - 1].clone();
                let a = self.stack[self.stack.len() - 2].clone();
                self.stack.push(a);
                self.stack.push(b);
            }

            // -- Arrays --
            Opcode::MakeArray => {
                let count = self.operand_index()?;
                self.need(count)?;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.pop()?);
                }
                self.stack.push(Value::array(elements));
            }
            Opcode::PushArrayIndex => {
                let index = self.pop()?.as_int()?;
                let array = self.pop_array()?;
                let elements = array.borrow();
                let element = usize::try_from(index)
                    .ok()
                    .and_then(|i| elements.get(i))
                    .cloned()
                    .ok_or(VmError::Bounds {
                        what: "array",
                        index: index as i64,
                        len: elements.len(),
                    })?;
                drop(elements);
                self.stack.push(element);
            }
            Opcode::SetArrayIndex => {
                let value = self.pop()?;
                let index = self.pop()?.as_int()?;
                let array = self.pop()?;
                {
                    let handle = match &array {
                        Value::Array(handle) => handle,
                        other => {
                            return Err(VmError::type_error(format!(
                                "expected array, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let mut elements = handle.borrow_mut();
                    let len = elements.len();
                    let slot = usize::try_from(index)
                        .ok()
                        .and_then(|i| elements.get_mut(i))
                        .ok_or(VmError::Bounds {
                            what: "array",
                            index: index as i64,
                            len,
                        })?;
                    *slot = value;
                }
                self.stack.push(array);
            }

            // -- Literal pushes --
            Opcode::PushInt => {
                let value = self.operand_i32()?;
                self.stack.push(Value::Int(value));
            }
            Opcode::PushDouble => {
                let value = read_f64(&self.image.instructions, &mut self.ip)?;
                self.stack.push(Value::Double(value));
            }
            Opcode::PushString => {
                let id = self.operand_u32()?;
                self.require_translations()?;
                let text = self.image.translation(id)?.to_string();
                self.stack.push(Value::String(text));
            }
            Opcode::PushBinaryString => {
                let id = self.operand_u32()?;
                let text = self.image.string(id)?.to_string();
                self.stack.push(Value::String(text));
            }
            Opcode::PushInterpolatedString => {
                let id = self.operand_u32()?;
                let count = self.operand_index()?;
                self.require_translations()?;
                let template = self.image.translation(id)?.to_string();
                let text = self.interpolate_with_args(&template, count)?;
                self.stack.push(Value::String(text));
            }
            Opcode::PushBinaryInterpolatedString => {
                let id = self.operand_u32()?;
                let count = self.operand_index()?;
                let template = self.image.string(id)?.to_string();
                let text = self.interpolate_with_args(&template, count)?;
                self.stack.push(Value::String(text));
            }

            // -- Arithmetic --
            Opcode::Addition => self.binary_op(Value::add)?,
            Opcode::Subtraction => self.binary_op(Value::sub)?,
            Opcode::Multiply => self.binary_op(Value::mul)?,
            Opcode::Divide => self.binary_op(Value::div)?,
            Opcode::Modulo => self.binary_op(Value::rem)?,
            Opcode::Power => self.binary_op(Value::pow)?,
            Opcode::Negate => self.unary_op(Value::neg)?,
            Opcode::Invert => self.unary_op(Value::invert)?,
            Opcode::BitLeftShift => self.binary_op(Value::bit_shl)?,
            Opcode::BitRightShift => self.binary_op(Value::bit_shr)?,
            Opcode::BitAnd => self.binary_op(Value::bit_and)?,
            Opcode::BitOr => self.binary_op(Value::bit_or)?,
            Opcode::BitXor => self.binary_op(Value::bit_xor)?,
            Opcode::BitNegate => self.unary_op(Value::bit_not)?,

            // -- Comparisons --
            Opcode::CompareEq => {
                let (lhs, rhs) = self.pop_pair()?;
                self.push_bool(lhs.eq_value(&rhs));
            }
            Opcode::CompareNeq => {
                let (lhs, rhs) = self.pop_pair()?;
                self.push_bool(!lhs.eq_value(&rhs));
            }
            Opcode::CompareGt => self.compare_op(|o| o.is_gt())?,
            Opcode::CompareGte => self.compare_op(|o| o.is_ge())?,
            Opcode::CompareLt => self.compare_op(|o| o.is_lt())?,
            Opcode::CompareLte => self.compare_op(|o| o.is_le())?,

            // -- Variables --
            Opcode::SetVarGlobal => {
                let id = self.operand_u32()?;
                let name = self.image.string(id)?.to_string();
                let value = self.pop()?;
                self.globals.insert(name, value);
            }
            Opcode::PushVarGlobal => {
                let id = self.operand_u32()?;
                let name = self.image.string(id)?;
                let value = self.globals.get(name).cloned().unwrap_or(Value::Undefined);
                self.stack.push(value);
            }
            Opcode::SetVarLocal => {
                let index = self.operand_index()?;
                let value = self.pop()?;
                if let Some(Slot::Flag(name)) = self.locals.slots.get(index) {
                    let name = name.clone();
                    self.flags.insert(name, value);
                } else {
                    self.locals.set_value(index, value);
                }
            }
            Opcode::PushVarLocal => {
                let index = self.operand_index()?;
                let value = match self.locals.slots.get(index) {
                    Some(Slot::Empty) => Value::Undefined,
                    Some(Slot::Value(v)) => v.clone(),
                    Some(Slot::Flag(name)) => {
                        self.flags.get(name).cloned().unwrap_or(Value::Undefined)
                    }
                    None => {
                        return Err(VmError::Bounds {
                            what: "locals",
                            index: index as i64,
                            len: self.locals.len(),
                        })
                    }
                };
                self.stack.push(value);
            }
            Opcode::FreeLocal => {
                let index = self.operand_index()?;
                if index >= self.locals.len() {
                    return Err(VmError::Bounds {
                        what: "locals",
                        index: index as i64,
                        len: self.locals.len(),
                    });
                }
                // empties the slot (dropping any flag binding) without
                // renumbering later slots
                self.locals.free(index);
            }

            // -- Control flow --
            Opcode::Jump => {
                let rel = self.operand_i32()?;
                self.ip = self.jump_target(rel)?;
            }
            Opcode::JumpTruthy => {
                let rel = self.operand_i32()?;
                let target = self.jump_target(rel)?;
                if self.pop()?.is_truthy() {
                    self.ip = target;
                }
            }
            Opcode::JumpFalsey => {
                let rel = self.operand_i32()?;
                let target = self.jump_target(rel)?;
                if !self.pop()?.is_truthy() {
                    self.ip = target;
                }
            }
            Opcode::Call => {
                let symbol = self.operand_u32()?;
                let argc = self.operand_index()?;
                let offsets = self
                    .image
                    .functions
                    .get(&symbol)
                    .cloned()
                    .ok_or_else(|| VmError::Lookup {
                        kind: "function",
                        name: self
                            .image
                            .string(symbol)
                            .map(str::to_string)
                            .unwrap_or_else(|_| format!("#{}", symbol)),
                    })?;
                if offsets.is_empty() {
                    return Err(VmError::load("function has no entry offset"));
                }

                // first popped argument becomes local slot 0
                self.need(argc)?;
                let mut callee_locals = Locals::default();
                for _ in 0..argc {
                    let value = self.pop()?;
                    callee_locals.slots.push(Slot::Value(value));
                }

                self.call_stack.push(Frame {
                    ip: self.ip,
                    stack: mem::take(&mut self.stack),
                    locals: mem::replace(&mut self.locals, callee_locals),
                });
                self.run_flag_preamble(&offsets)?;
                self.ip = Self::entry_ip(offsets[0])?;
            }
            Opcode::CallExternal => {
                let id = self.operand_u32()?;
                let argc = self.operand_index()?;
                let name = self.image.string(id)?.to_string();
                self.need(argc)?;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop()?);
                }
                let result = self
                    .registry
                    .invoke(&name, &args)
                    .map_err(|message| VmError::Host { name, message })?;
                self.stack.push(result);
            }
            Opcode::Return => {
                let value = self.pop()?;
                if self.call_stack.len() <= base {
                    return Err(VmError::state("return with no saved frame"));
                }
                self.restore_frame()?;
                self.stack.push(value);
            }
            Opcode::Exit => {
                self.locals.clear();
                if self.call_stack.len() <= base {
                    return Ok(Flow::Halt);
                }
                self.restore_frame()?;
                self.stack.push(Value::Undefined);
            }

            // -- Choices --
            Opcode::ChoiceBegin => {
                if self.in_choice {
                    return Err(VmError::state("ChoiceBegin while already building a choice"));
                }
                self.in_choice = true;
            }
            Opcode::ChoiceAdd => {
                let rel = self.operand_i32()?;
                let target = self.jump_target(rel)?;
                if !self.in_choice {
                    return Err(VmError::state("ChoiceAdd outside a choice"));
                }
                let chance = self.pop()?.as_double()?;
                let text = self.pop()?.as_str()?.to_string();
                if (self.chance_cb)(&mut self.rng, chance) {
                    self.choices.push(ChoiceEntry { target, text });
                }
            }
            Opcode::ChoiceAddTruthy => {
                let rel = self.operand_i32()?;
                let target = self.jump_target(rel)?;
                if !self.in_choice {
                    return Err(VmError::state("ChoiceAddTruthy outside a choice"));
                }
                let chance = self.pop()?.as_double()?;
                let text = self.pop()?.as_str()?.to_string();
                let guard = self.pop()?;
                if guard.is_truthy() && (self.chance_cb)(&mut self.rng, chance) {
                    self.choices.push(ChoiceEntry { target, text });
                }
            }
            Opcode::ChoiceSelect => {
                if !self.in_choice {
                    return Err(VmError::state("ChoiceSelect outside a choice"));
                }
                if self.choices.is_empty() {
                    return Err(VmError::state("ChoiceSelect with no choices"));
                }
                self.select_choice = true;
                self.paused = true;
                debug!(count = self.choices.len(), "awaiting choice selection");
                return Ok(Flow::Suspend);
            }
            Opcode::ChooseAdd => {
                let rel = self.operand_i32()?;
                let target = self.jump_target(rel)?;
                let chance = self.pop()?.as_double()?;
                self.choose_options.push((chance, target));
            }
            Opcode::ChooseAddTruthy => {
                let rel = self.operand_i32()?;
                let target = self.jump_target(rel)?;
                let guard = self.pop()?;
                let chance = self.pop()?.as_double()?;
                if guard.is_truthy() {
                    self.choose_options.push((chance, target));
                }
            }
            Opcode::ChooseSel => {
                if self.choose_options.is_empty() {
                    return Err(VmError::state("ChooseSel with no options"));
                }
                let weights: Vec<f64> = self.choose_options.iter().map(|(w, _)| *w).collect();
                let index = (self.weighted_cb)(&mut self.rng, &weights);
                let target = self
                    .choose_options
                    .get(index)
                    .map(|(_, t)| *t)
                    .ok_or_else(|| {
                        VmError::state(format!(
                            "weighted callback returned {} for {} options",
                            index,
                            weights.len()
                        ))
                    })?;
                self.ip = target;
                self.choose_options.clear();
            }

            // -- Text --
            Opcode::TextRun => {
                let text = self.pop()?.as_str()?.to_string();
                debug!(text = %text, "running text");
                self.current_text = text;
                self.running_text = true;
                self.paused = true;
                return Ok(Flow::Suspend);
            }
        }
        Ok(Flow::Normal)
    }

    // -- Helpers -------------------------------------------------------

    fn restore_frame(&mut self) -> VmResult<()> {
        let frame = self
            .call_stack
            .pop()
            .ok_or_else(|| VmError::state("no saved frame to restore"))?;
        self.ip = frame.ip;
        self.stack = frame.stack;
        self.locals = frame.locals;
        Ok(())
    }

    /// Read an i32 operand and advance past it
    #[inline]
    fn operand_i32(&mut self) -> VmResult<i32> {
        read_i32(&self.image.instructions, &mut self.ip)
    }

    /// Read an i32 operand that indexes a table; rejects negatives
    #[inline]
    fn operand_u32(&mut self) -> VmResult<u32> {
        let value = self.operand_i32()?;
        u32::try_from(value).map_err(|_| VmError::Bounds {
            what: "table",
            index: value as i64,
            len: 0,
        })
    }

    /// Read an i32 operand used as a count or slot index
    #[inline]
    fn operand_index(&mut self) -> VmResult<usize> {
        let value = self.operand_i32()?;
        usize::try_from(value).map_err(|_| VmError::Bounds {
            what: "operand",
            index: value as i64,
            len: 0,
        })
    }

    /// Resolve a relative jump against the post-operand position
    fn jump_target(&self, rel: i32) -> VmResult<usize> {
        let target = self.ip as i64 + rel as i64;
        usize::try_from(target).map_err(|_| VmError::Bounds {
            what: "jump target",
            index: target,
            len: self.image.instructions.len(),
        })
    }

    /// Check the stack can supply `count` operands before any are taken
    #[inline]
    fn need(&self, count: usize) -> VmResult<()> {
        if self.stack.len() < count {
            return Err(VmError::StackUnderflow {
                needed: count,
                available: self.stack.len(),
            });
        }
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }

    #[inline]
    fn peek(&self) -> VmResult<&Value> {
        self.stack.last().ok_or(VmError::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }

    fn pop_array(&mut self) -> VmResult<std::rc::Rc<std::cell::RefCell<Vec<Value>>>> {
        match self.pop()? {
            Value::Array(handle) => Ok(handle),
            other => Err(VmError::type_error(format!(
                "expected array, got {}",
                other.type_name()
            ))),
        }
    }

    /// Pop the operand pair of a binary op: the second pop is the
    /// left-hand side.
    fn pop_pair(&mut self) -> VmResult<(Value, Value)> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        Ok((lhs, rhs))
    }

    fn binary_op(&mut self, op: fn(&Value, &Value) -> VmResult<Value>) -> VmResult<()> {
        let (lhs, rhs) = self.pop_pair()?;
        self.stack.push(op(&lhs, &rhs)?);
        Ok(())
    }

    fn unary_op(&mut self, op: fn(&Value) -> VmResult<Value>) -> VmResult<()> {
        let value = self.pop()?;
        self.stack.push(op(&value)?);
        Ok(())
    }

    fn compare_op(&mut self, test: fn(std::cmp::Ordering) -> bool) -> VmResult<()> {
        let (lhs, rhs) = self.pop_pair()?;
        let ordering = lhs.compare(&rhs)?;
        self.push_bool(test(ordering));
        Ok(())
    }

    fn push_bool(&mut self, b: bool) {
        self.stack.push(Value::Int(if b { 1 } else { 0 }));
    }

    /// Pop `count` interpolation arguments (first popped substitutes
    /// `{0}`) and render the template.
    fn interpolate_with_args(&mut self, template: &str, count: usize) -> VmResult<String> {
        self.need(count)?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(self.pop()?);
        }
        Ok(interpolate::render(template, &args))
    }

    /// Dialogue opcodes must not run before translations are loaded.
    fn require_translations(&self) -> VmResult<()> {
        if !self.image.translation_loaded {
            warn!("dialogue opcode executed before translations were loaded");
            return Err(VmError::state("translations not loaded"));
        }
        Ok(())
    }
}
