//! Lox core: the runtime foundation shared by the compiler and the VM.
//!
//! Key design principles:
//! - `Value`: what the language talks about (nil, booleans, numbers,
//!   object handles). Small and `Copy`.
//! - `Obj`: everything with identity lives in the `Heap` behind an
//!   `ObjRef` handle; strings are interned so identity doubles as
//!   content equality.
//! - `Chunk`: bytecode plus constants and a per-byte line map.
//! - `Table`: open-addressing hash table keyed by interned strings,
//!   used for globals, fields, methods, and the intern set itself.
//! - `Heap`: allocation accounting and the mark-sweep collector; the
//!   root owner (the VM) drives collections.

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::Heap;
pub use object::{
    BoundMethod, Class, Closure, Function, Instance, Native, NativeFn, Obj, ObjRef, StrObj, Upvalue,
};
pub use table::{Table, hash_str};
pub use value::Value;
