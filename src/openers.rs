//! Entry points that build an initial [`Session`].

use byteorder::ByteOrder;
use signature_scanner::Signature;
use tracing::debug;

use crate::manager::MemoryManager;
use crate::region::{MemoryRegion, ViewableRegion};
use crate::safe_pointer::SafePointer;
use crate::search_constraints::SearchConstraints;
use crate::session::Session;

/// A one-element session.
pub fn pointer<M: MemoryManager>(manager: &M, address: usize) -> Session<'_, M> {
    pointer_list(manager, [address])
}

/// A session holding one pointer per address.
pub fn pointer_list<M: MemoryManager>(
    manager: &M,
    addresses: impl IntoIterator<Item = usize>,
) -> Session<'_, M> {
    Session::from_addresses(manager, addresses)
}

/// Follows a pointer array: dereference `array`, step to slot `index`,
/// dereference again. The classic virtual-function-table lookup.
pub fn pointer_array<E: ByteOrder, M: MemoryManager>(
    manager: &M,
    array: usize,
    index: usize,
) -> Session<'_, M> {
    let mut entry = SafePointer::new(manager, array);
    entry
        .dereference::<E>()
        .add(index * std::mem::size_of::<usize>())
        .dereference::<E>();
    Session::new(manager, vec![entry])
}

/// One pointer per accepted region, at the region's base address.
pub fn regions<'mgr, M: MemoryManager>(
    manager: &'mgr M,
    constraints: &SearchConstraints<M::Region>,
) -> Session<'mgr, M> {
    let bases: Vec<usize> = manager
        .layout()
        .iter()
        .filter(|region| constraints.allows_region(region))
        .map(|region| region.address())
        .collect();
    debug!(regions = bases.len(), "region enumeration opened a session");
    Session::from_addresses(manager, bases)
}

/// Every occurrence of `signature` across all accepted regions, each clamped
/// to the constraint window.
pub fn signature<'mgr, M>(
    manager: &'mgr M,
    signature: &Signature,
    constraints: &SearchConstraints<M::Region>,
) -> Session<'mgr, M>
where
    M: MemoryManager,
    M::Region: ViewableRegion,
{
    let mut addresses = Vec::new();

    for region in manager.layout() {
        if !constraints.allows_region(region) {
            continue;
        }

        let view = region.view();
        let window = constraints.clamp_to_range(region.address(), 0..view.len());
        let base = region.address() + window.start;
        addresses.extend(signature.all(&view[window]).map(|offset| base + offset));
    }

    debug!(hits = addresses.len(), "signature scan opened a session");
    Session::from_addresses(manager, addresses)
}
