//! A pruned collection of safe pointers on which operations are broadcast.

use byteorder::ByteOrder;
use signature_scanner::Signature;
use thiserror::Error;

use crate::manager::MemoryManager;
use crate::region::ViewableRegion;
use crate::safe_pointer::{SafePointer, XRefTypes};
use crate::search_constraints::SearchConstraints;

/// Why a session could not be collapsed to a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FinalizeError {
    #[error("no pointers left in the session")]
    NoPointersLeft,
    #[error("more than one pointer left in the session")]
    TooManyPointersLeft,
}

/// An ordered set of safe pointers sharing one memory manager.
///
/// Chained operations mutate the session in place and return it, so a whole
/// search reads as a single expression. After every broadcast or fan-out the
/// session holds no invalid pointer and no two pointers with the same
/// address; the pointer vector is kept address-sorted, which makes iteration
/// deterministic.
pub struct Session<'mgr, M: MemoryManager> {
    manager: &'mgr M,
    pointers: Vec<SafePointer<'mgr, M>>,
}

impl<'mgr, M: MemoryManager> Session<'mgr, M> {
    pub fn new(manager: &'mgr M, pointers: Vec<SafePointer<'mgr, M>>) -> Self {
        let mut session = Self { manager, pointers };
        session.tidy();
        session
    }

    pub fn from_addresses(
        manager: &'mgr M,
        addresses: impl IntoIterator<Item = usize>,
    ) -> Self {
        let pointers = addresses
            .into_iter()
            .map(|address| SafePointer::new(manager, address))
            .collect();
        Self::new(manager, pointers)
    }

    pub fn manager(&self) -> &'mgr M {
        self.manager
    }

    fn tidy(&mut self) {
        self.pointers.sort_unstable();
        self.pointers.dedup();
    }

    // Manipulation

    /// Advances all pointers forward.
    pub fn add(&mut self, operand: usize) -> &mut Self {
        self.for_each(|pointer| {
            pointer.add(operand);
        })
    }

    /// Inverse of [`add`](Self::add).
    pub fn sub(&mut self, operand: usize) -> &mut Self {
        self.for_each(|pointer| {
            pointer.sub(operand);
        })
    }

    /// Follows the pointer stored at each element.
    pub fn dereference<E: ByteOrder>(&mut self) -> &mut Self {
        self.for_each(|pointer| {
            pointer.dereference::<E>();
        })
    }

    /// Resolves a PC-relative displacement at each element.
    pub fn relative_to_absolute<E: ByteOrder>(&mut self) -> &mut Self {
        self.for_each(|pointer| {
            pointer.relative_to_absolute::<E>();
        })
    }

    /// Steps each element past its current instruction.
    pub fn next_instruction<Isa: lde::Isa>(&mut self) -> &mut Self {
        self.for_each(|pointer| {
            pointer.next_instruction::<Isa>();
        })
    }

    // Advanced flow

    /// Calls `body` on each pointer, then prunes every pointer that is no
    /// longer valid and deduplicates by address.
    pub fn for_each<F>(&mut self, mut body: F) -> &mut Self
    where
        F: FnMut(&mut SafePointer<'mgr, M>),
    {
        self.pointers.retain_mut(|pointer| {
            body(pointer);
            pointer.is_valid(1)
        });
        self.tidy();
        self
    }

    /// Repeats `action` on each pointer until it returns `false`. Pruning is
    /// deferred to the enclosing broadcast.
    pub fn repeater<F>(&mut self, mut action: F) -> &mut Self
    where
        F: FnMut(&mut SafePointer<'mgr, M>) -> bool,
    {
        self.for_each(move |pointer| while action(pointer) {})
    }

    /// Repeats `action` exactly `iterations` times on each pointer.
    pub fn repeater_n<F>(&mut self, iterations: usize, mut action: F) -> &mut Self
    where
        F: FnMut(&mut SafePointer<'mgr, M>),
    {
        self.for_each(move |pointer| {
            for _ in 0..iterations {
                action(pointer);
            }
        })
    }

    /// Invalidates every pointer the predicate rejects, letting the broadcast
    /// prune it.
    pub fn filter<F>(&mut self, mut predicate: F) -> &mut Self
    where
        F: FnMut(&SafePointer<'mgr, M>) -> bool,
    {
        self.for_each(move |pointer| {
            if !predicate(pointer) {
                pointer.invalidate();
            }
        })
    }

    /// Filters by the per-pointer constraint test.
    pub fn constrain(&mut self, constraints: &SearchConstraints<M::Region>) -> &mut Self {
        self.filter(|pointer| pointer.filter(constraints))
    }

    /// Replaces each pointer with the transformer's output; invalid results
    /// are dropped and duplicates collapse, exactly as for broadcasts.
    pub fn flat_map<F>(&mut self, mut transformer: F) -> &mut Self
    where
        F: FnMut(&SafePointer<'mgr, M>) -> Vec<SafePointer<'mgr, M>>,
    {
        let mut next = Vec::new();
        for pointer in &self.pointers {
            next.extend(
                transformer(pointer)
                    .into_iter()
                    .filter(|new_pointer| new_pointer.is_valid(1)),
            );
        }
        self.pointers = next;
        self.tidy();
        self
    }

    // Signatures

    /// Moves each pointer to the previous occurrence of the signature inside
    /// its region.
    pub fn prev_signature_occurrence(
        &mut self,
        signature: &Signature,
        constraints: &SearchConstraints<M::Region>,
    ) -> &mut Self
    where
        M::Region: ViewableRegion,
    {
        self.for_each(|pointer| {
            pointer.prev_signature_occurrence(signature, constraints);
        })
    }

    /// Moves each pointer to the next occurrence of the signature inside its
    /// region.
    pub fn next_signature_occurrence(
        &mut self,
        signature: &Signature,
        constraints: &SearchConstraints<M::Region>,
    ) -> &mut Self
    where
        M::Region: ViewableRegion,
    {
        self.for_each(|pointer| {
            pointer.next_signature_occurrence(signature, constraints);
        })
    }

    /// Replaces each pointer with everything that references it.
    pub fn find_xrefs<E: ByteOrder>(
        &mut self,
        types: XRefTypes,
        displacement_length: usize,
        constraints: &SearchConstraints<M::Region>,
    ) -> &mut Self
    where
        M::Region: ViewableRegion,
    {
        self.flat_map(|pointer| pointer.find_xrefs::<E>(types, displacement_length, constraints))
    }

    // Finalizing

    /// Borrows the remaining pointers without consuming the session.
    pub fn peek(&self) -> &[SafePointer<'mgr, M>] {
        &self.pointers
    }

    pub fn size(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// The unique remaining address, or why there is none.
    pub fn finalize(&self) -> Result<usize, FinalizeError> {
        match self.pointers.as_slice() {
            [only] => Ok(only.address()),
            [] => Err(FinalizeError::NoPointersLeft),
            _ => Err(FinalizeError::TooManyPointersLeft),
        }
    }

    /// As [`finalize`](Self::finalize), but panics with `message` when the
    /// session does not contain exactly one pointer.
    pub fn expect(&self, message: &str) -> usize {
        self.expect_with(message, message)
    }

    /// As [`expect`](Self::expect) with separate messages for the empty and
    /// the ambiguous case.
    pub fn expect_with(&self, none: &str, too_many: &str) -> usize {
        match self.finalize() {
            Ok(address) => address,
            Err(FinalizeError::NoPointersLeft) => panic!("{none}"),
            Err(FinalizeError::TooManyPointersLeft) => panic!("{too_many}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use byteorder::NativeEndian;

    use super::*;
    use crate::testing::{FakeMemory, FakeRegion};

    fn memory() -> FakeMemory {
        FakeMemory::new(vec![FakeRegion::new(
            0x1000,
            (0u8..=0xff).collect::<Vec<_>>(),
        )])
    }

    #[test]
    fn broadcasts_prune_invalid_pointers() {
        let memory = memory();
        // 0x10f0 + 0x20 leaves the region; 0x1000 + 0x20 stays inside.
        let mut session = Session::from_addresses(&memory, [0x1000, 0x10f0]);
        session.add(0x20);

        assert_eq!(session.size(), 1);
        assert!(session.peek().iter().all(|pointer| pointer.is_valid(1)));
        assert_eq!(session.finalize(), Ok(0x1020));
    }

    #[test]
    fn empty_sessions_stay_empty_through_broadcasts() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, []);
        session
            .add(4)
            .dereference::<NativeEndian>()
            .relative_to_absolute::<NativeEndian>();
        assert!(session.is_empty());
        assert_eq!(session.finalize(), Err(FinalizeError::NoPointersLeft));
    }

    #[test]
    fn noop_for_each_only_prunes() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000, 0x1040, 0x2000]);
        session.for_each(|_| {});
        let addresses: Vec<usize> =
            session.peek().iter().map(|pointer| pointer.address()).collect();
        assert_eq!(addresses, vec![0x1000, 0x1040]);
    }

    #[test]
    fn finalize_reports_ambiguity() {
        let memory = memory();
        let session = Session::from_addresses(&memory, [0x1000, 0x1004]);
        assert_eq!(session.finalize(), Err(FinalizeError::TooManyPointersLeft));
        assert!(session.peek().len() > 1);
    }

    #[test]
    fn a_single_pointer_finalizes_to_its_address() {
        let memory = memory();
        let session = Session::from_addresses(&memory, [0x1042]);
        assert_eq!(session.peek().len(), 1);
        assert_eq!(session.finalize(), Ok(0x1042));
        assert_eq!(session.expect("missing"), 0x1042);
    }

    #[test]
    #[should_panic(expected = "nothing found")]
    fn expect_panics_with_the_empty_message() {
        let memory = memory();
        let session = Session::from_addresses(&memory, []);
        session.expect_with("nothing found", "too many");
    }

    #[test]
    #[should_panic(expected = "too many")]
    fn expect_panics_with_the_ambiguous_message() {
        let memory = memory();
        let session = Session::from_addresses(&memory, [0x1000, 0x1004]);
        session.expect_with("nothing found", "too many");
    }

    #[test]
    fn duplicate_addresses_collapse() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000, 0x1008]);
        // Both land on 0x1010.
        session.for_each(|pointer| {
            let target = 0x1010;
            let delta = target - pointer.address();
            pointer.add(delta);
        });
        assert_eq!(session.size(), 1);
        assert_eq!(session.finalize(), Ok(0x1010));
    }

    #[test]
    fn repeater_runs_until_the_action_declines() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000]);
        session.repeater(|pointer| {
            pointer.add(0x10);
            pointer.address() < 0x1080
        });
        assert_eq!(session.finalize(), Ok(0x1080));
    }

    #[test]
    fn counted_repeater_runs_exactly_n_times() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000]);
        session.repeater_n(5, |pointer| {
            pointer.add(4);
        });
        assert_eq!(session.finalize(), Ok(0x1014));
    }

    #[test]
    fn filter_drops_rejected_pointers() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000, 0x1010, 0x1020]);
        session.filter(|pointer| pointer.address() != 0x1010);
        let addresses: Vec<usize> =
            session.peek().iter().map(|pointer| pointer.address()).collect();
        assert_eq!(addresses, vec![0x1000, 0x1020]);
    }

    #[test]
    fn constrain_applies_the_window() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000, 0x1010, 0x1020]);
        session.constrain(&SearchConstraints::everything().from(0x1008).to(0x1018));
        assert_eq!(session.finalize(), Ok(0x1010));
    }

    #[test]
    fn flat_map_prunes_and_deduplicates_its_output() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000, 0x1004]);
        session.flat_map(|pointer| {
            vec![
                // Same fan-out for both inputs: duplicates must collapse.
                SafePointer::new(pointer.manager(), 0x1020),
                // Unmapped: must be dropped.
                SafePointer::new(pointer.manager(), 0x9000),
            ]
        });
        assert_eq!(session.size(), 1);
        assert_eq!(session.finalize(), Ok(0x1020));
    }

    #[test]
    fn flat_map_can_empty_the_session() {
        let memory = memory();
        let mut session = Session::from_addresses(&memory, [0x1000]);
        session.flat_map(|_| Vec::new());
        assert_eq!(session.finalize(), Err(FinalizeError::NoPointersLeft));
    }
}
