pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod error;
pub mod heap;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use compiler::compile;
pub use debug::{disassemble_chunk, disassemble_function, disassemble_instruction};
pub use error::{Backtrace, BacktraceFrame, CompileError, RuntimeError};
pub use heap::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, Heap, InstanceObj, NativeFn, NativeObj,
    ObjData, ObjRef, UpvalueObj,
};
pub use table::Table;
pub use value::{Value, ValueDisplay};
