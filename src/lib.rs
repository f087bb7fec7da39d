//! DNX Dialogue VM
//!
//! A stack-based virtual machine for executing precompiled dialogue
//! programs embedded in host applications. The VM drives narrative
//! flow — spoken lines, branching choices, weighted random
//! continuations, interpolated strings, persistent flags and host
//! function calls — and yields cooperative control to the host at every
//! suspension point.
//!
//! # Architecture
//!
//! - **Binary image**: a deserialized `DNX` program (opcode stream,
//!   string and translation tables, scene/function/definition indexes)
//! - **One instruction per tick**: `update()` decodes and executes a
//!   single instruction or returns immediately while paused
//! - **Suspension points**: text lines, pending choice selections and
//!   scene completion raise flags the host inspects
//! - **Registry pattern**: host functions live behind the
//!   [`FunctionRegistry`] trait
//!
//! # Example Usage
//!
//! ```ignore
//! use dnx_vm::{BinaryImage, Interpreter, MapRegistry};
//!
//! let image = BinaryImage::from_file("intro.dnx")?;
//! let mut registry = MapRegistry::new();
//! registry.register("play_sound", |args| { /* ... */ Ok(args[0].clone()) });
//!
//! let mut vm = Interpreter::new(image, registry);
//! vm.run_scene("intro")?;
//! loop {
//!     vm.update()?;
//!     if vm.running_text() {
//!         println!("{}", vm.current_text());
//!         vm.resume();
//!     } else if vm.select_choice() {
//!         vm.choose_choice(pick(vm.choices()))?;
//!     } else if vm.scene_completed() {
//!         break;
//!     }
//! }
//! ```

// Core modules
pub mod error;
pub mod image;
pub mod interpolate;
pub mod interpreter;
pub mod opcodes;
pub mod registry;
pub mod value;

// Re-export main types for convenience
pub use error::{VmError, VmResult};
pub use image::{BinaryImage, Definition, StringRef, FORMAT_VERSION};
pub use interpreter::{ChanceCallback, Interpreter, WeightedChanceCallback};
pub use opcodes::Opcode;
pub use registry::{FunctionRegistry, MapRegistry, NullRegistry};
pub use value::Value;
