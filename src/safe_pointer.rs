//! A pointer that cannot cause read access violations.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use byteorder::ByteOrder;
use signature_scanner::Signature;
use tracing::trace;
use x86_xref::{AbsoluteFinder, RelativeAndAbsoluteFinder, RelativeFinder};

use crate::manager::MemoryManager;
use crate::region::{MemoryRegion, ViewableRegion};
use crate::search_constraints::SearchConstraints;

/// Longest encodable x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Which encodings a cross-reference search should look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XRefTypes {
    pub relative: bool,
    pub absolute: bool,
}

impl XRefTypes {
    pub fn relative() -> Self {
        Self { relative: true, absolute: false }
    }

    pub fn absolute() -> Self {
        Self { relative: false, absolute: true }
    }

    pub fn both() -> Self {
        Self { relative: true, absolute: true }
    }
}

#[cfg(target_pointer_width = "64")]
type RelativeDisplacement = i32;
#[cfg(not(target_pointer_width = "64"))]
type RelativeDisplacement = i16;

/// An address paired with a sticky invalid flag.
///
/// Every read, search and disassembly step validates the touched byte range
/// against the manager's layout first; a failure sets the flag instead of
/// faulting, and subsequent operations on the pointer report failure until a
/// successful search revalidates it.
pub struct SafePointer<'mgr, M: MemoryManager> {
    manager: &'mgr M,
    address: usize,
    invalid: bool,
}

impl<'mgr, M: MemoryManager> SafePointer<'mgr, M> {
    pub fn new(manager: &'mgr M, address: usize) -> Self {
        Self { manager, address, invalid: false }
    }

    pub fn with_validity(manager: &'mgr M, address: usize, invalid: bool) -> Self {
        Self { manager, address, invalid }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn manager(&self) -> &'mgr M {
        self.manager
    }

    /// Whether a previous operation failed.
    pub fn is_marked_invalid(&self) -> bool {
        self.invalid
    }

    pub fn invalidate(&mut self) -> &mut Self {
        self.invalid = true;
        self
    }

    pub fn revalidate(&mut self) -> &mut Self {
        self.invalid = false;
        self
    }

    /// Whether `[address, address + length)` is fully covered by adjacent
    /// regions of the layout, each readable when the manager demands it, and
    /// no previous operation failed.
    pub fn is_valid(&self, length: usize) -> bool {
        if self.invalid {
            return false;
        }

        let Some(end) = self.address.checked_add(length) else {
            return false;
        };

        let mut probe = self.address;
        while probe < end {
            let Some(region) = self.manager.layout().find_region(probe) else {
                return false;
            };
            if M::REQUIRES_PERMISSIONS_FOR_READING && !self.manager.region_is_readable(region) {
                return false;
            }
            probe = region.end();
        }

        true
    }

    /// Fills `out` from the current address. Returns `false` without touching
    /// `out` when the range is not valid or the manager fails.
    pub fn read(&self, out: &mut [u8]) -> bool {
        if !self.is_valid(out.len()) {
            return false;
        }
        self.manager.read(self.address, out)
    }

    pub fn read_u8(&self) -> Option<u8> {
        let mut buffer = [0u8; 1];
        self.read(&mut buffer).then_some(buffer[0])
    }

    pub fn read_i16<E: ByteOrder>(&self) -> Option<i16> {
        let mut buffer = [0u8; 2];
        self.read(&mut buffer).then(|| E::read_i16(&buffer))
    }

    pub fn read_i32<E: ByteOrder>(&self) -> Option<i32> {
        let mut buffer = [0u8; 4];
        self.read(&mut buffer).then(|| E::read_i32(&buffer))
    }

    /// Reads a machine-word address.
    pub fn read_word<E: ByteOrder>(&self) -> Option<usize> {
        let mut buffer = [0u8; std::mem::size_of::<usize>()];
        if !self.read(&mut buffer) {
            return None;
        }
        if cfg!(target_pointer_width = "64") {
            Some(E::read_u64(&buffer) as usize)
        } else {
            Some(E::read_u32(&buffer) as usize)
        }
    }

    pub fn add(&mut self, operand: usize) -> &mut Self {
        self.address = self.address.wrapping_add(operand);
        self
    }

    pub fn sub(&mut self, operand: usize) -> &mut Self {
        self.address = self.address.wrapping_sub(operand);
        self
    }

    /// Follows the pointer stored at the current address.
    pub fn dereference<E: ByteOrder>(&mut self) -> &mut Self {
        match self.read_word::<E>() {
            Some(target) => {
                self.address = target;
                self.revalidate()
            }
            None => self.invalidate(),
        }
    }

    /// Resolves a signed PC-relative displacement into the address it refers
    /// to: 32-bit on 64-bit targets, 16-bit otherwise.
    pub fn relative_to_absolute<E: ByteOrder>(&mut self) -> &mut Self {
        const WIDTH: usize = std::mem::size_of::<RelativeDisplacement>();

        let mut buffer = [0u8; WIDTH];
        if !self.read(&mut buffer) {
            return self.invalidate();
        }

        #[cfg(target_pointer_width = "64")]
        let displacement = E::read_i32(&buffer) as isize;
        #[cfg(not(target_pointer_width = "64"))]
        let displacement = E::read_i16(&buffer) as isize;

        self.add(WIDTH);
        if displacement >= 0 {
            self.add(displacement as usize)
        } else {
            self.sub(displacement.unsigned_abs())
        }
    }

    /// Advances past the instruction at the current address using the length
    /// disassembler. An undecodable byte sequence invalidates.
    pub fn next_instruction<Isa: lde::Isa>(&mut self) -> &mut Self {
        let Some(region) = self.manager.layout().find_region(self.address) else {
            return self.invalidate();
        };

        let available = (region.end() - self.address).min(MAX_INSTRUCTION_LENGTH);
        let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
        if !self.read(&mut bytes[..available]) {
            return self.invalidate();
        }

        let length = Isa::ld(&bytes[..available]);
        if length == 0 {
            return self.invalidate();
        }
        self.add(length as usize)
    }

    /// Reads `signature.get_elements().len()` bytes and tests them against
    /// the signature. `false` on read failure.
    pub fn does_match(&self, signature: &Signature) -> bool {
        let mut buffer = vec![0u8; signature.get_elements().len()];
        if !self.read(&mut buffer) {
            return false;
        }
        signature.matches(&buffer)
    }

    /// Whether the containing region is accepted by the constraints and the
    /// address lies inside the constraint window.
    pub fn filter(&self, constraints: &SearchConstraints<M::Region>) -> bool {
        match self.manager.layout().find_region(self.address) {
            Some(region) => {
                constraints.allows_region(region) && constraints.allows_address(self.address)
            }
            None => false,
        }
    }
}

impl<'mgr, M> SafePointer<'mgr, M>
where
    M: MemoryManager,
    M::Region: ViewableRegion,
{
    /// Moves to the first occurrence of `signature` at or after the current
    /// address. The search never leaves the containing region; whole-process
    /// scans go through the `signature` opener instead.
    pub fn next_signature_occurrence(
        &mut self,
        signature: &Signature,
        constraints: &SearchConstraints<M::Region>,
    ) -> &mut Self {
        let Some(region) = self.manager.layout().find_region(self.address) else {
            return self.invalidate();
        };
        if !constraints.allows_region(region) {
            return self.invalidate();
        }

        let view = region.view();
        let offset = self.address - region.address();
        let window = constraints.clamp_to_range(region.address(), offset..view.len());

        match signature.next(&view[window.clone()]) {
            Some(hit) => {
                self.address = region.address() + window.start + hit;
                self.revalidate()
            }
            None => self.invalidate(),
        }
    }

    /// Moves to the last occurrence of `signature` strictly before the
    /// current address; mirror of
    /// [`next_signature_occurrence`](Self::next_signature_occurrence).
    pub fn prev_signature_occurrence(
        &mut self,
        signature: &Signature,
        constraints: &SearchConstraints<M::Region>,
    ) -> &mut Self {
        let Some(region) = self.manager.layout().find_region(self.address) else {
            return self.invalidate();
        };
        if !constraints.allows_region(region) {
            return self.invalidate();
        }

        let view = region.view();
        let offset = self.address - region.address();
        let window = constraints.clamp_to_range(region.address(), 0..offset);

        match signature.prev(&view[window.clone()]) {
            Some(hit) => {
                // `hit` is the distance from the window end back to the first
                // byte of the match.
                self.address = region.address() + window.end - hit;
                self.revalidate()
            }
            None => self.invalidate(),
        }
    }

    /// Collects one new pointer per place that references the current
    /// address, across every region the constraints accept. `self` is left
    /// untouched.
    ///
    /// `displacement_length` is the width of the relative displacement to
    /// look for (4 for the usual rel32 forms).
    pub fn find_xrefs<E: ByteOrder>(
        &self,
        types: XRefTypes,
        displacement_length: usize,
        constraints: &SearchConstraints<M::Region>,
    ) -> Vec<SafePointer<'mgr, M>> {
        let mut references = Vec::new();

        for region in self.manager.layout() {
            if !constraints.allows_region(region) {
                continue;
            }

            let view = region.view();
            let window = constraints.clamp_to_range(region.address(), 0..view.len());
            let base = region.address() + window.start;
            let bytes = &view[window];

            match (types.relative, types.absolute) {
                (true, true) => {
                    let finder = RelativeAndAbsoluteFinder::<E>::new(
                        base,
                        displacement_length,
                        self.address,
                    );
                    references.extend(
                        finder
                            .all(bytes)
                            .map(|offset| SafePointer::new(self.manager, base + offset)),
                    );
                }
                (true, false) => {
                    let finder = RelativeFinder::<E>::new(base, displacement_length, self.address);
                    references.extend(
                        finder
                            .all(bytes)
                            .map(|offset| SafePointer::new(self.manager, base + offset)),
                    );
                }
                (false, true) => {
                    let finder = AbsoluteFinder::<E>::new(self.address);
                    references.extend(
                        finder
                            .all(bytes)
                            .map(|offset| SafePointer::new(self.manager, base + offset)),
                    );
                }
                (false, false) => {}
            }
        }

        trace!(
            target_address = self.address,
            hits = references.len(),
            "cross-reference search finished"
        );
        references
    }
}

impl<M: MemoryManager> Clone for SafePointer<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: MemoryManager> Copy for SafePointer<'_, M> {}

impl<M: MemoryManager> fmt::Debug for SafePointer<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafePointer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("invalid", &self.invalid)
            .finish()
    }
}

impl<M: MemoryManager> PartialEq for SafePointer<'_, M> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<M: MemoryManager> Eq for SafePointer<'_, M> {}

impl<M: MemoryManager> PartialOrd for SafePointer<'_, M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M: MemoryManager> Ord for SafePointer<'_, M> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl<M: MemoryManager> Hash for SafePointer<'_, M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use byteorder::NativeEndian;
    use signature_scanner::Signature;

    use super::*;
    use crate::flags::RegionFlags;
    use crate::testing::{FakeMemory, FakeRegion};

    fn two_adjacent_regions() -> FakeMemory {
        FakeMemory::new(vec![
            FakeRegion::new(0x1000, (0u8..0x10).collect::<Vec<_>>()),
            FakeRegion::new(0x1010, (0x10u8..0x20).collect::<Vec<_>>()),
        ])
    }

    #[test]
    fn validity_walks_adjacent_regions() {
        let memory = two_adjacent_regions();
        let pointer = SafePointer::new(&memory, 0x100c);
        assert!(pointer.is_valid(4));
        assert!(pointer.is_valid(8));
        assert!(pointer.is_valid(0x14));
        assert!(!pointer.is_valid(0x15));
    }

    #[test]
    fn one_past_the_last_readable_byte_is_invalid() {
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, vec![0u8; 0x10])]);
        assert!(SafePointer::new(&memory, 0x100f).is_valid(1));
        assert!(!SafePointer::new(&memory, 0x1010).is_valid(1));
    }

    #[test]
    fn gaps_break_the_validity_walk() {
        let memory = FakeMemory::new(vec![
            FakeRegion::new(0x1000, vec![0u8; 0x10]),
            FakeRegion::new(0x1018, vec![0u8; 0x10]),
        ]);
        let pointer = SafePointer::new(&memory, 0x1008);
        assert!(pointer.is_valid(8));
        assert!(!pointer.is_valid(9));
    }

    #[test]
    fn unreadable_regions_fail_validation() {
        let memory = FakeMemory::new(vec![
            FakeRegion::new(0x1000, vec![0u8; 0x10]).with_flags(RegionFlags::empty())
        ]);
        assert!(!SafePointer::new(&memory, 0x1000).is_valid(1));
    }

    #[test]
    fn read_fills_exactly_and_crosses_region_boundaries() {
        let memory = two_adjacent_regions();
        let pointer = SafePointer::new(&memory, 0x100e);
        let mut buffer = [0u8; 4];
        assert!(pointer.read(&mut buffer));
        assert_eq!(buffer, [0x0e, 0x0f, 0x10, 0x11]);
    }

    #[test]
    fn failed_read_leaves_the_buffer_untouched() {
        let memory = two_adjacent_regions();
        let pointer = SafePointer::new(&memory, 0x2000);
        let mut buffer = [0xaau8; 4];
        assert!(!pointer.read(&mut buffer));
        assert_eq!(buffer, [0xaa; 4]);
    }

    #[test]
    fn arithmetic_is_exact() {
        let memory = two_adjacent_regions();
        let mut pointer = SafePointer::new(&memory, 0x1234);
        pointer.add(0x5678).sub(0x5678);
        assert_eq!(pointer.address(), 0x1234);
    }

    #[test]
    fn dereference_follows_stored_pointers() {
        let mut bytes = vec![0u8; 0x20];
        bytes[..std::mem::size_of::<usize>()]
            .copy_from_slice(&0x1010usize.to_ne_bytes());
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, bytes)]);

        let mut pointer = SafePointer::new(&memory, 0x1000);
        pointer.dereference::<NativeEndian>();
        assert_eq!(pointer.address(), 0x1010);
        assert!(pointer.is_valid(1));
    }

    #[test]
    fn dereferencing_unmapped_memory_invalidates() {
        let memory = two_adjacent_regions();
        let mut pointer = SafePointer::new(&memory, 0);
        pointer.dereference::<NativeEndian>();
        assert!(pointer.is_marked_invalid());
        assert!(!pointer.is_valid(1));
        // The address is left untouched and the flag is sticky.
        assert_eq!(pointer.address(), 0);
        pointer.add(0x1000);
        assert!(!pointer.is_valid(1));
    }

    #[test]
    fn invalid_flag_is_cleared_by_a_successful_search() {
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, b"needle".to_vec())]);
        let mut pointer = SafePointer::new(&memory, 0x1000);
        pointer.invalidate();

        pointer.next_signature_occurrence(
            &Signature::string("needle", false),
            &SearchConstraints::everything(),
        );
        assert!(!pointer.is_marked_invalid());
        assert_eq!(pointer.address(), 0x1000);
    }

    #[test]
    fn a_match_under_the_cursor_is_found_in_place() {
        let memory = FakeMemory::new(vec![FakeRegion::new(
            0x1000,
            b"xxxxneedlexxxx".to_vec(),
        )]);
        let signature = Signature::string("needle", false);

        let mut pointer = SafePointer::new(&memory, 0x1004);
        assert!(pointer.does_match(&signature));
        pointer.next_signature_occurrence(&signature, &SearchConstraints::everything());
        assert_eq!(pointer.address(), 0x1004);
    }

    #[test]
    fn next_occurrence_at_the_last_possible_position() {
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, b"xxneedle".to_vec())]);
        let signature = Signature::string("needle", false);

        let mut pointer = SafePointer::new(&memory, 0x1002);
        pointer.next_signature_occurrence(&signature, &SearchConstraints::everything());
        assert_eq!(pointer.address(), 0x1002);
        assert!(pointer.is_valid(1));

        let mut pointer = SafePointer::new(&memory, 0x1003);
        pointer.next_signature_occurrence(&signature, &SearchConstraints::everything());
        assert!(pointer.is_marked_invalid());
    }

    #[test]
    fn prev_occurrence_searches_before_the_cursor() {
        let memory = FakeMemory::new(vec![FakeRegion::new(
            0x1000,
            b"xxneedlexxxxxxxx".to_vec(),
        )]);
        let signature = Signature::string("needle", false);

        let mut pointer = SafePointer::new(&memory, 0x100c);
        pointer.prev_signature_occurrence(&signature, &SearchConstraints::everything());
        assert_eq!(pointer.address(), 0x1002);

        // Nothing before the very start of the region.
        let mut pointer = SafePointer::new(&memory, 0x1001);
        pointer.prev_signature_occurrence(&signature, &SearchConstraints::everything());
        assert!(pointer.is_marked_invalid());
    }

    #[test]
    fn searches_never_leave_the_containing_region() {
        let memory = FakeMemory::new(vec![
            FakeRegion::new(0x1000, b"xxxxxxxx".to_vec()),
            FakeRegion::new(0x1008, b"needlexx".to_vec()),
        ]);
        let mut pointer = SafePointer::new(&memory, 0x1000);
        pointer.next_signature_occurrence(
            &Signature::string("needle", false),
            &SearchConstraints::everything(),
        );
        assert!(pointer.is_marked_invalid());
    }

    #[test]
    fn rejected_region_invalidates_the_search() {
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, b"needle".to_vec())]);
        let mut pointer = SafePointer::new(&memory, 0x1000);
        pointer.next_signature_occurrence(
            &Signature::string("needle", false),
            &SearchConstraints::everything().with_name("elsewhere"),
        );
        assert!(pointer.is_marked_invalid());
    }

    #[test]
    fn relative_to_absolute_resolves_positive_displacements() {
        let width = std::mem::size_of::<RelativeDisplacement>();
        let mut bytes = vec![0u8; 0x20];
        let displacement: RelativeDisplacement = 0x10;
        bytes[..width].copy_from_slice(&displacement.to_ne_bytes());
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, bytes)]);

        let mut pointer = SafePointer::new(&memory, 0x1000);
        pointer.relative_to_absolute::<NativeEndian>();
        assert_eq!(pointer.address(), 0x1000 + width + 0x10);
    }

    #[test]
    fn relative_to_absolute_resolves_negative_displacements() {
        let width = std::mem::size_of::<RelativeDisplacement>();
        let mut bytes = vec![0u8; 0x20];
        let displacement = -(width as RelativeDisplacement);
        bytes[8..8 + width].copy_from_slice(&displacement.to_ne_bytes());
        let memory = FakeMemory::new(vec![FakeRegion::new(0x1000, bytes)]);

        // Encoding `-width` points the displacement back at itself.
        let mut pointer = SafePointer::new(&memory, 0x1008);
        pointer.relative_to_absolute::<NativeEndian>();
        assert_eq!(pointer.address(), 0x1008);
    }

    #[test]
    fn filter_combines_region_acceptance_and_window() {
        let memory = FakeMemory::new(vec![
            FakeRegion::new(0x1000, vec![0u8; 0x100]).with_name("keep")
        ]);
        let pointer = SafePointer::new(&memory, 0x1080);

        assert!(pointer.filter(&SearchConstraints::everything().with_name("keep")));
        assert!(!pointer.filter(&SearchConstraints::everything().with_name("drop")));
        assert!(!pointer.filter(
            &SearchConstraints::everything().from(0x1000).to(0x1080)
        ));
        assert!(pointer.filter(
            &SearchConstraints::everything().from(0x1080).to(0x1081)
        ));
        assert!(!SafePointer::new(&memory, 0x2000)
            .filter(&SearchConstraints::everything()));
    }

    #[test]
    fn ordering_and_equality_are_by_address() {
        let memory = two_adjacent_regions();
        let a = SafePointer::new(&memory, 0x1000);
        let mut b = SafePointer::new(&memory, 0x1000);
        b.invalidate();
        let c = SafePointer::new(&memory, 0x1004);

        assert_eq!(a, b);
        assert!(a < c);
    }
}
