//! # memchain
//!
//! Composable, never-faulting search chains over process memory.
//!
//! A chain starts at an opener (a signature scan, a pointer, a region
//! enumeration), broadcasts pointer-level steps over every candidate,
//! silently drops candidates that stop making sense, and collapses to a
//! single address at the end.
//!
//! ## Features:
//! - IDA and string signatures
//! - Cross references (relative and absolute)
//! - Length-disassembler stepping
//! - Capability-typed search constraints
//! - Cached and live process managers
//! - Builder pattern
//!
//! ## Usage:
//!
//! ```no_run
//! use byteorder::NativeEndian;
//! use memchain::{openers, ProcessSnapshot, SearchConstraints, Signature, XRefTypes};
//!
//! let process = ProcessSnapshot::current()?;
//!
//! // Find the one place a string is referenced from executable code and
//! // resolve the call that follows it.
//! let call_opcode = Signature::ida("E8");
//! let target = openers::signature(
//!     &process,
//!     &Signature::string("You will never find me!", false),
//!     &SearchConstraints::everything().thats_readable(),
//! )
//! .find_xrefs::<NativeEndian>(
//!     XRefTypes::both(),
//!     4,
//!     &SearchConstraints::everything().with_name("demo").thats_executable(),
//! )
//! .add(4)
//! .repeater(|pointer| {
//!     pointer.next_instruction::<lde::X64>();
//!     !pointer.does_match(&call_opcode)
//! })
//! .add(5)
//! .filter(|pointer| pointer.does_match(&call_opcode))
//! .add(1)
//! .relative_to_absolute::<NativeEndian>()
//! .finalize()?;
//! # let _ = target;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Openers and single steps work just as well on their own:
//!
//! ```no_run
//! use byteorder::NativeEndian;
//! use memchain::{openers, ProcessSnapshot, SearchConstraints};
//!
//! let process = ProcessSnapshot::current()?;
//!
//! // Fourth slot of a virtual function table.
//! let method = openers::pointer_array::<NativeEndian, _>(&process, 0x7f0000001000, 3)
//!     .expect("vtable walk failed");
//!
//! // Base addresses of every executable mapping of one module.
//! let code = openers::regions(
//!     &process,
//!     &SearchConstraints::everything().with_name("libdemo.so").thats_executable(),
//! );
//! # let _ = (method, code);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod flags;
pub mod layout;
pub mod live;
pub mod manager;
pub mod openers;
pub mod region;
pub mod safe_pointer;
pub mod search_constraints;
pub mod session;
pub mod snapshot;

#[cfg(feature = "capi")]
pub mod ffi;

#[cfg(test)]
pub(crate) mod testing;

pub use flags::{FlagSpecification, RegionFlags};
pub use layout::Layout;
pub use live::{LiveProcess, MappedRegion};
pub use manager::MemoryManager;
pub use region::{
    FlaggedRegion, MemoryRegion, NamedRegion, PathedRegion, SharedRegion, ViewableRegion,
};
pub use safe_pointer::{SafePointer, XRefTypes, MAX_INSTRUCTION_LENGTH};
pub use search_constraints::SearchConstraints;
pub use session::{FinalizeError, Session};
pub use snapshot::{ProcessSnapshot, SnapshotError, SnapshotRegion};

pub use signature_scanner::Signature;
