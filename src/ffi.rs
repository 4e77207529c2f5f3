//! Flat C surface over the snapshot manager, constraints, session and safe
//! pointer.
//!
//! Every handle is heap-allocated and owned by the caller until the matching
//! `_free` call. A session borrows its process handle: the process must stay
//! alive (and must not be freed) for as long as any session created from it
//! exists. Callbacks are function-pointer + context pairs; a null callback is
//! a no-op. Endianness is fixed to the host's, the instruction decoder to the
//! host's x86 mode.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_void, CStr};

use byteorder::NativeEndian;
use signature_scanner::Signature;

use crate::openers;
use crate::safe_pointer::{SafePointer, XRefTypes};
use crate::search_constraints::SearchConstraints;
use crate::session::{FinalizeError, Session};
use crate::snapshot::{ProcessSnapshot, SnapshotRegion};

#[cfg(target_pointer_width = "64")]
type NativeIsa = lde::X64;
#[cfg(not(target_pointer_width = "64"))]
type NativeIsa = lde::X86;

type PointerImpl = SafePointer<'static, ProcessSnapshot>;
type SessionImpl = Session<'static, ProcessSnapshot>;
type ConstraintsImpl = SearchConstraints<SnapshotRegion>;

pub struct McProcess(ProcessSnapshot);

pub struct McConstraints(ConstraintsImpl);

pub struct McSession(SessionImpl);

#[repr(transparent)]
pub struct McSafePointer(PointerImpl);

pub struct McAddressSink {
    manager: &'static ProcessSnapshot,
    addresses: Vec<usize>,
}

pub type McForEachFn = extern "C" fn(pointer: *mut McSafePointer, context: *mut c_void);
pub type McRepeatFn = extern "C" fn(pointer: *mut McSafePointer, context: *mut c_void) -> bool;
pub type McFilterFn = extern "C" fn(pointer: *const McSafePointer, context: *mut c_void) -> bool;
pub type McTransformFn =
    extern "C" fn(pointer: *const McSafePointer, sink: *mut McAddressSink, context: *mut c_void);

pub const MC_OK: i32 = 0;
pub const MC_NO_POINTERS_LEFT: i32 = 1;
pub const MC_TOO_MANY_POINTERS_LEFT: i32 = 2;

unsafe fn manager(process: *const McProcess) -> &'static ProcessSnapshot {
    &*(&(*process).0 as *const ProcessSnapshot)
}

unsafe fn constraints_or_everything(constraints: *const McConstraints) -> ConstraintsImpl {
    if constraints.is_null() {
        SearchConstraints::everything()
    } else {
        (*constraints).0.clone()
    }
}

unsafe fn parse_pattern(pattern: *const c_char) -> Option<Signature> {
    let pattern = CStr::from_ptr(pattern).to_str().ok()?;
    Some(Signature::ida(pattern))
}

unsafe fn update_constraints(
    constraints: *mut McConstraints,
    f: impl FnOnce(ConstraintsImpl) -> ConstraintsImpl,
) -> *mut McConstraints {
    let slot = &mut (*constraints).0;
    let taken = std::mem::replace(slot, SearchConstraints::everything());
    *slot = f(taken);
    constraints
}

// Process handles

#[no_mangle]
pub unsafe extern "C" fn mc_process_current() -> *mut McProcess {
    match ProcessSnapshot::current() {
        Ok(snapshot) => Box::into_raw(Box::new(McProcess(snapshot))),
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn mc_process_attach(pid: i32) -> *mut McProcess {
    match ProcessSnapshot::attach(pid) {
        Ok(snapshot) => Box::into_raw(Box::new(McProcess(snapshot))),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Re-snapshots the process. Only valid while no session built from this
/// handle is alive.
#[no_mangle]
pub unsafe extern "C" fn mc_process_refresh(process: *mut McProcess) -> bool {
    (*process).0.refresh().is_ok()
}

#[no_mangle]
pub unsafe extern "C" fn mc_process_free(process: *mut McProcess) {
    if !process.is_null() {
        drop(Box::from_raw(process));
    }
}

// Constraint handles

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_everything() -> *mut McConstraints {
    Box::into_raw(Box::new(McConstraints(SearchConstraints::everything())))
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_clone(
    constraints: *const McConstraints,
) -> *mut McConstraints {
    Box::into_raw(Box::new(McConstraints((*constraints).0.clone())))
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_with_name(
    constraints: *mut McConstraints,
    name: *const c_char,
) -> *mut McConstraints {
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return constraints;
    };
    let name = name.to_owned();
    update_constraints(constraints, move |c| c.with_name(name))
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_with_path(
    constraints: *mut McConstraints,
    path: *const c_char,
) -> *mut McConstraints {
    let Ok(path) = CStr::from_ptr(path).to_str() else {
        return constraints;
    };
    let path = path.to_owned();
    update_constraints(constraints, move |c| c.with_path(path))
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_from(
    constraints: *mut McConstraints,
    address: usize,
) -> *mut McConstraints {
    update_constraints(constraints, move |c| c.from(address))
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_to(
    constraints: *mut McConstraints,
    address: usize,
) -> *mut McConstraints {
    update_constraints(constraints, move |c| c.to(address))
}

/// `flags` is the three-glyph tri-state form, e.g. `"r-x"` or `"r**"`.
#[no_mangle]
pub unsafe extern "C" fn mc_constraints_with_flags(
    constraints: *mut McConstraints,
    flags: *const c_char,
) -> *mut McConstraints {
    let Ok(flags) = CStr::from_ptr(flags).to_str() else {
        return constraints;
    };
    let flags = flags.to_owned();
    update_constraints(constraints, move |c| c.with_flags(flags.as_str()))
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_thats_shared(
    constraints: *mut McConstraints,
) -> *mut McConstraints {
    update_constraints(constraints, |c| c.thats_shared())
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_thats_private(
    constraints: *mut McConstraints,
) -> *mut McConstraints {
    update_constraints(constraints, |c| c.thats_private())
}

#[no_mangle]
pub unsafe extern "C" fn mc_constraints_free(constraints: *mut McConstraints) {
    if !constraints.is_null() {
        drop(Box::from_raw(constraints));
    }
}

// Openers

#[no_mangle]
pub unsafe extern "C" fn mc_session_signature(
    process: *const McProcess,
    ida_pattern: *const c_char,
    constraints: *const McConstraints,
) -> *mut McSession {
    let Some(pattern) = parse_pattern(ida_pattern) else {
        return std::ptr::null_mut();
    };
    let constraints = constraints_or_everything(constraints);
    let session = openers::signature(manager(process), &pattern, &constraints);
    Box::into_raw(Box::new(McSession(session)))
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_string(
    process: *const McProcess,
    string: *const c_char,
    include_terminator: bool,
    constraints: *const McConstraints,
) -> *mut McSession {
    let Ok(string) = CStr::from_ptr(string).to_str() else {
        return std::ptr::null_mut();
    };
    let pattern = Signature::string(string, include_terminator);
    let constraints = constraints_or_everything(constraints);
    let session = openers::signature(manager(process), &pattern, &constraints);
    Box::into_raw(Box::new(McSession(session)))
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_pointer(
    process: *const McProcess,
    address: usize,
) -> *mut McSession {
    Box::into_raw(Box::new(McSession(openers::pointer(
        manager(process),
        address,
    ))))
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_pointer_list(
    process: *const McProcess,
    addresses: *const usize,
    count: usize,
) -> *mut McSession {
    let addresses = std::slice::from_raw_parts(addresses, count);
    Box::into_raw(Box::new(McSession(openers::pointer_list(
        manager(process),
        addresses.iter().copied(),
    ))))
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_pointer_array(
    process: *const McProcess,
    array: usize,
    index: usize,
) -> *mut McSession {
    Box::into_raw(Box::new(McSession(openers::pointer_array::<NativeEndian, _>(
        manager(process),
        array,
        index,
    ))))
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_regions(
    process: *const McProcess,
    constraints: *const McConstraints,
) -> *mut McSession {
    let constraints = constraints_or_everything(constraints);
    Box::into_raw(Box::new(McSession(openers::regions(
        manager(process),
        &constraints,
    ))))
}

// Broadcast operations

#[no_mangle]
pub unsafe extern "C" fn mc_session_add(session: *mut McSession, operand: usize) -> *mut McSession {
    (*session).0.add(operand);
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_sub(session: *mut McSession, operand: usize) -> *mut McSession {
    (*session).0.sub(operand);
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_dereference(session: *mut McSession) -> *mut McSession {
    (*session).0.dereference::<NativeEndian>();
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_relative_to_absolute(
    session: *mut McSession,
) -> *mut McSession {
    (*session).0.relative_to_absolute::<NativeEndian>();
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_next_instruction(session: *mut McSession) -> *mut McSession {
    (*session).0.next_instruction::<NativeIsa>();
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_next_occurrence(
    session: *mut McSession,
    ida_pattern: *const c_char,
    constraints: *const McConstraints,
) -> *mut McSession {
    if let Some(pattern) = parse_pattern(ida_pattern) {
        let constraints = constraints_or_everything(constraints);
        (*session).0.next_signature_occurrence(&pattern, &constraints);
    }
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_prev_occurrence(
    session: *mut McSession,
    ida_pattern: *const c_char,
    constraints: *const McConstraints,
) -> *mut McSession {
    if let Some(pattern) = parse_pattern(ida_pattern) {
        let constraints = constraints_or_everything(constraints);
        (*session).0.prev_signature_occurrence(&pattern, &constraints);
    }
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_find_xrefs(
    session: *mut McSession,
    relative: bool,
    absolute: bool,
    displacement_length: usize,
    constraints: *const McConstraints,
) -> *mut McSession {
    let types = XRefTypes { relative, absolute };
    let constraints = constraints_or_everything(constraints);
    (*session)
        .0
        .find_xrefs::<NativeEndian>(types, displacement_length, &constraints);
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_constrain(
    session: *mut McSession,
    constraints: *const McConstraints,
) -> *mut McSession {
    let constraints = constraints_or_everything(constraints);
    (*session).0.constrain(&constraints);
    session
}

// Callback-driven flow

#[no_mangle]
pub unsafe extern "C" fn mc_session_for_each(
    session: *mut McSession,
    body: Option<McForEachFn>,
    context: *mut c_void,
) -> *mut McSession {
    let Some(body) = body else { return session };
    (*session).0.for_each(|pointer| {
        body((pointer as *mut PointerImpl).cast::<McSafePointer>(), context);
    });
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_repeater(
    session: *mut McSession,
    action: Option<McRepeatFn>,
    context: *mut c_void,
) -> *mut McSession {
    let Some(action) = action else { return session };
    (*session).0.repeater(|pointer| {
        action((pointer as *mut PointerImpl).cast::<McSafePointer>(), context)
    });
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_repeater_n(
    session: *mut McSession,
    iterations: usize,
    action: Option<McForEachFn>,
    context: *mut c_void,
) -> *mut McSession {
    let Some(action) = action else { return session };
    (*session).0.repeater_n(iterations, |pointer| {
        action((pointer as *mut PointerImpl).cast::<McSafePointer>(), context);
    });
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_filter(
    session: *mut McSession,
    predicate: Option<McFilterFn>,
    context: *mut c_void,
) -> *mut McSession {
    let Some(predicate) = predicate else { return session };
    (*session).0.filter(|pointer| {
        predicate((pointer as *const PointerImpl).cast::<McSafePointer>(), context)
    });
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_flat_map(
    session: *mut McSession,
    transformer: Option<McTransformFn>,
    context: *mut c_void,
) -> *mut McSession {
    let Some(transformer) = transformer else { return session };
    let manager = (*session).0.manager();
    (*session).0.flat_map(|pointer| {
        let mut sink = McAddressSink {
            manager,
            addresses: Vec::new(),
        };
        transformer(
            (pointer as *const PointerImpl).cast::<McSafePointer>(),
            &mut sink,
            context,
        );
        let McAddressSink { manager, addresses } = sink;
        addresses
            .into_iter()
            .map(|address| SafePointer::new(manager, address))
            .collect()
    });
    session
}

#[no_mangle]
pub unsafe extern "C" fn mc_address_sink_push(sink: *mut McAddressSink, address: usize) {
    (*sink).addresses.push(address);
}

// Observation and teardown

#[no_mangle]
pub unsafe extern "C" fn mc_session_size(session: *const McSession) -> usize {
    (*session).0.size()
}

/// Copies up to `capacity` remaining addresses into `out`; returns how many
/// were written.
#[no_mangle]
pub unsafe extern "C" fn mc_session_peek(
    session: *const McSession,
    out: *mut usize,
    capacity: usize,
) -> usize {
    let pointers = (*session).0.peek();
    let count = pointers.len().min(capacity);
    for (index, pointer) in pointers.iter().take(count).enumerate() {
        *out.add(index) = pointer.address();
    }
    count
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_finalize(session: *const McSession, out: *mut usize) -> i32 {
    match (*session).0.finalize() {
        Ok(address) => {
            if !out.is_null() {
                *out = address;
            }
            MC_OK
        }
        Err(FinalizeError::NoPointersLeft) => MC_NO_POINTERS_LEFT,
        Err(FinalizeError::TooManyPointersLeft) => MC_TOO_MANY_POINTERS_LEFT,
    }
}

#[no_mangle]
pub unsafe extern "C" fn mc_session_free(session: *mut McSession) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

// Safe-pointer accessors for callbacks

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_address(pointer: *const McSafePointer) -> usize {
    (*pointer).0.address()
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_is_valid(
    pointer: *const McSafePointer,
    length: usize,
) -> bool {
    (*pointer).0.is_valid(length)
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_read(
    pointer: *const McSafePointer,
    out: *mut c_void,
    length: usize,
) -> bool {
    let out = std::slice::from_raw_parts_mut(out.cast::<u8>(), length);
    (*pointer).0.read(out)
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_add(
    pointer: *mut McSafePointer,
    operand: usize,
) -> *mut McSafePointer {
    (*pointer).0.add(operand);
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_sub(
    pointer: *mut McSafePointer,
    operand: usize,
) -> *mut McSafePointer {
    (*pointer).0.sub(operand);
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_dereference(
    pointer: *mut McSafePointer,
) -> *mut McSafePointer {
    (*pointer).0.dereference::<NativeEndian>();
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_relative_to_absolute(
    pointer: *mut McSafePointer,
) -> *mut McSafePointer {
    (*pointer).0.relative_to_absolute::<NativeEndian>();
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_next_instruction(
    pointer: *mut McSafePointer,
) -> *mut McSafePointer {
    (*pointer).0.next_instruction::<NativeIsa>();
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_invalidate(
    pointer: *mut McSafePointer,
) -> *mut McSafePointer {
    (*pointer).0.invalidate();
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_revalidate(
    pointer: *mut McSafePointer,
) -> *mut McSafePointer {
    (*pointer).0.revalidate();
    pointer
}

#[no_mangle]
pub unsafe extern "C" fn mc_safe_pointer_does_match(
    pointer: *const McSafePointer,
    ida_pattern: *const c_char,
) -> bool {
    match parse_pattern(ida_pattern) {
        Some(pattern) => (*pointer).0.does_match(&pattern),
        None => false,
    }
}
