//! The ECMA-335 I.8.7 type normal forms and the stack-state lattice built on
//! them: slot merge (the join used at control-flow merge points),
//! assignability, and the binary-comparability relaxations.

use fxhash::FxHashSet;

use crate::stack::{SlotFlags, SlotKind, StackSlot};
use crate::typesystem::{TypeKind, TypeSystem, WellKnownType};

type Slot<T> = StackSlot<<T as TypeSystem>::Type, <T as TypeSystem>::Method>;

/// The reduced type: unsigned integer types fold onto their signed
/// counterparts, enums onto their underlying type.
pub fn reduced_type<T: TypeSystem>(sys: &T, ty: T::Type) -> T::Type {
	match sys.kind(ty) {
		TypeKind::UInt8 => sys.well_known(WellKnownType::SByte),
		TypeKind::UInt16 => sys.well_known(WellKnownType::Int16),
		TypeKind::UInt32 => sys.well_known(WellKnownType::Int32),
		TypeKind::UInt64 => sys.well_known(WellKnownType::Int64),
		TypeKind::UIntPtr => sys.well_known(WellKnownType::IntPtr),
		TypeKind::Enum => reduced_type(sys, sys.enum_underlying(ty)),
		_ => ty,
	}
}

/// The verification type: the reduced type with Bool and Char folded onto
/// their same-width signed integers. The unsigned reduction runs first; the
/// Bool/Char mapping applies to the already-reduced type.
///
/// By-ref types are returned unchanged; by-ref operands are compared
/// element-wise through [`verification_types_match`].
pub fn verification_type<T: TypeSystem>(sys: &T, ty: T::Type) -> T::Type {
	let reduced = reduced_type(sys, ty);
	match sys.kind(reduced) {
		TypeKind::Bool => sys.well_known(WellKnownType::SByte),
		TypeKind::Char => sys.well_known(WellKnownType::Int16),
		_ => reduced,
	}
}

/// The intermediate type: the verification type widened to what actually
/// occupies an evaluation-stack slot.
pub fn intermediate_type<T: TypeSystem>(sys: &T, ty: T::Type) -> T::Type {
	let verification = verification_type(sys, ty);
	match sys.kind(verification) {
		TypeKind::Int8 | TypeKind::Int16 | TypeKind::Int32 => sys.well_known(WellKnownType::Int32),
		TypeKind::Single | TypeKind::Double => sys.well_known(WellKnownType::Double),
		_ => verification,
	}
}

/// Do two types agree up to their verification types? This is the
/// "size equivalence" the indirect load/store opcodes permit.
pub fn verification_types_match<T: TypeSystem>(sys: &T, a: T::Type, b: T::Type) -> bool {
	let (ka, kb) = (sys.kind(a), sys.kind(b));
	if ka == TypeKind::ByRef || kb == TypeKind::ByRef {
		return match (sys.element_type(a), sys.element_type(b)) {
			(Some(ea), Some(eb)) if ka == kb => verification_types_match(sys, ea, eb),
			_ => false,
		};
	}
	let canonical = |ty, kind| match kind {
		// unmanaged pointers occupy native-int slots
		TypeKind::Pointer | TypeKind::FunctionPointer => sys.well_known(WellKnownType::IntPtr),
		_ => verification_type(sys, ty),
	};
	canonical(a, ka) == canonical(b, kb)
}

/// The lattice join of two slots arriving at the same block entry.
/// `None` means the states are irreconcilable and the method is invalid.
pub fn merge_slots<T: TypeSystem>(sys: &T, a: &Slot<T>, b: &Slot<T>) -> Option<Slot<T>> {
	// read-only is sticky; the other flags survive only when both sides agree
	let flags = (a.flags() & b.flags()) | ((a.flags() | b.flags()) & SlotFlags::READ_ONLY);

	if a.kind() == b.kind()
		&& a.type_identity() == b.type_identity()
		&& a.method_identity() == b.method_identity()
	{
		return Some(a.with_flags(flags));
	}

	match (a.kind(), b.kind()) {
		(SlotKind::ObjRef, SlotKind::ObjRef) => {
			let merged = match (a.type_identity(), b.type_identity()) {
				(None, _) => *b,
				(_, None) => *a,
				(Some(ta), Some(tb)) => StackSlot::obj_ref(merge_object_references(sys, ta, tb)),
			};
			Some(merged.with_flags(flags))
		}
		// a method pointer meeting a plain native int loses its identity
		(SlotKind::NativeInt, SlotKind::NativeInt) => Some(StackSlot::native_int().with_flags(flags)),
		_ => None,
	}
}

/// The common supertype of two object references. Total: `System.Object`
/// is the answer of last resort.
pub fn merge_object_references<T: TypeSystem>(sys: &T, a: T::Type, b: T::Type) -> T::Type {
	if a == b {
		return a;
	}

	let object = sys.well_known(WellKnownType::Object);
	let (ka, kb) = (sys.kind(a), sys.kind(b));

	if ka == TypeKind::Array && kb == TypeKind::Array {
		return merge_array_types(sys, a, b);
	}

	if ka == TypeKind::GenericParameter || kb == TypeKind::GenericParameter {
		if ka == TypeKind::GenericParameter && sys.is_assignable_to(a, b) {
			return b;
		}
		if kb == TypeKind::GenericParameter && sys.is_assignable_to(b, a) {
			return a;
		}
		return object;
	}

	match (ka == TypeKind::Interface, kb == TypeKind::Interface) {
		(true, true) => {
			if sys.is_assignable_to(a, b) {
				return b;
			}
			if sys.is_assignable_to(b, a) {
				return a;
			}
			common_interface(sys, a, b).unwrap_or(object)
		}
		(false, true) => match sys.is_assignable_to(a, b) {
			true => b,
			false => common_interface(sys, a, b).unwrap_or(object),
		},
		(true, false) => match sys.is_assignable_to(b, a) {
			true => a,
			false => common_interface(sys, a, b).unwrap_or(object),
		},
		(false, false) => common_ancestor(sys, a, b),
	}
}

fn merge_array_types<T: TypeSystem>(sys: &T, a: T::Type, b: T::Type) -> T::Type {
	let array = sys.well_known(WellKnownType::Array);
	let (rank_a, rank_b) = (sys.array_rank(a), sys.array_rank(b));
	if rank_a != rank_b || sys.is_sz_array(a) != sys.is_sz_array(b) {
		return array;
	}
	let (Some(ea), Some(eb)) = (sys.element_type(a), sys.element_type(b)) else {
		return array;
	};
	// value-typed elements either agree exactly (handled by the caller's
	// identity check) or have no common array shape
	if !(sys.kind(ea).is_reference() && sys.kind(eb).is_reference()) {
		return array;
	}
	let element = merge_object_references(sys, ea, eb);
	match sys.is_sz_array(a) {
		true => sys.sz_array_of(element),
		false => sys.array_of(element, rank_a),
	}
}

/// The interface closure of `ty`: interfaces of the type and its base chain,
/// then everything those interfaces extend, in first-reached order.
fn interface_closure<T: TypeSystem>(sys: &T, ty: T::Type) -> Vec<T::Type> {
	let mut seen = FxHashSet::default();
	let mut order = Vec::new();

	let mut current = Some(ty);
	while let Some(t) = current {
		for interface in sys.interfaces(t) {
			if seen.insert(interface) {
				order.push(interface);
			}
		}
		current = sys.base_type(t);
	}

	let mut i = 0;
	while i < order.len() {
		for interface in sys.interfaces(order[i]) {
			if seen.insert(interface) {
				order.push(interface);
			}
		}
		i += 1;
	}

	order
}

fn common_interface<T: TypeSystem>(sys: &T, a: T::Type, b: T::Type) -> Option<T::Type> {
	let of_b: FxHashSet<_> = interface_closure(sys, b).into_iter().collect();
	interface_closure(sys, a).into_iter().find(|interface| of_b.contains(interface))
}

fn common_ancestor<T: TypeSystem>(sys: &T, a: T::Type, b: T::Type) -> T::Type {
	let mut chain_a = FxHashSet::default();
	let mut current = Some(a);
	while let Some(t) = current {
		chain_a.insert(t);
		current = sys.base_type(t);
	}
	let mut current = Some(b);
	while let Some(t) = current {
		if chain_a.contains(&t) {
			return t;
		}
		current = sys.base_type(t);
	}
	sys.well_known(WellKnownType::Object)
}

/// Can `src` be stored into a location of type `dst`? Used at stores,
/// returns and argument passing. `allow_size_equivalence` admits the
/// reduced-type relaxation certain indirect opcodes permit.
pub fn slot_assignable_to<T: TypeSystem>(
	sys: &T,
	src: &Slot<T>,
	dst: T::Type,
	allow_size_equivalence: bool,
) -> bool {
	let dst_slot: Slot<T> = StackSlot::of_type(sys, dst);
	match dst_slot.kind() {
		SlotKind::Int32 => src.kind() == SlotKind::Int32,
		SlotKind::Int64 => src.kind() == SlotKind::Int64,
		SlotKind::Float => src.kind() == SlotKind::Float,
		SlotKind::NativeInt => matches!(src.kind(), SlotKind::NativeInt | SlotKind::Int32),
		SlotKind::ObjRef => match (src.kind(), src.type_identity()) {
			(SlotKind::ObjRef, None) => true,
			(SlotKind::ObjRef, Some(ty)) => sys.is_assignable_to(ty, dst),
			_ => false,
		},
		SlotKind::ByRef => {
			// a read-only pointer never flows into a writable location
			src.kind() == SlotKind::ByRef && !src.is_read_only() && {
				let src_element = src.type_identity().expect("by-ref slot without an element");
				let dst_element = dst_slot.type_identity().expect("by-ref slot without an element");
				src_element == dst_element
					|| (allow_size_equivalence
						&& reduced_type(sys, src_element) == reduced_type(sys, dst_element))
			}
		}
		SlotKind::ValueType => {
			src.kind() == SlotKind::ValueType && {
				let src_ty = src.type_identity().expect("value-type slot without a type");
				src_ty == dst
					|| (allow_size_equivalence && reduced_type(sys, src_ty) == reduced_type(sys, dst))
			}
		}
		SlotKind::Unknown => true,
	}
}

/// Result kind of a two-operand numeric instruction, per the ECMA-335 III.1.5
/// binary operand tables. `None` marks a forbidden pairing.
pub(crate) fn binary_numeric_result(a: SlotKind, b: SlotKind, allow_float: bool) -> Option<SlotKind> {
	match (a, b) {
		(SlotKind::Int32, SlotKind::Int32) => Some(SlotKind::Int32),
		(SlotKind::Int64, SlotKind::Int64) => Some(SlotKind::Int64),
		(SlotKind::Int32, SlotKind::NativeInt)
		| (SlotKind::NativeInt, SlotKind::Int32)
		| (SlotKind::NativeInt, SlotKind::NativeInt) => Some(SlotKind::NativeInt),
		(SlotKind::Float, SlotKind::Float) if allow_float => Some(SlotKind::Float),
		_ => None,
	}
}

/// Binary comparability for the comparison and conditional-branch opcodes:
/// the numeric pairings, plus the pointer and object-reference relaxations.
/// `equality` marks beq/bne.un/ceq-class opcodes; `objref_ok` additionally
/// admits the idiomatic object null-compare (beq, bne.un, ceq, cgt.un).
pub(crate) fn binary_comparable<T: TypeSystem>(
	_sys: &T,
	a: &Slot<T>,
	b: &Slot<T>,
	equality: bool,
	objref_ok: bool,
) -> bool {
	match (a.kind(), b.kind()) {
		(SlotKind::ObjRef, SlotKind::ObjRef) => objref_ok,
		(SlotKind::ByRef, SlotKind::ByRef) => true,
		(SlotKind::ByRef, SlotKind::NativeInt) | (SlotKind::NativeInt, SlotKind::ByRef) => equality,
		(ka, kb) => binary_numeric_result(ka, kb, true).is_some(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::stack::SlotKind::*;

	#[test]
	fn numeric_pairs_follow_the_binary_tables() {
		assert_eq!(binary_numeric_result(Int32, Int32, true), Some(Int32));
		assert_eq!(binary_numeric_result(Int64, Int64, true), Some(Int64));
		assert_eq!(binary_numeric_result(Int32, NativeInt, true), Some(NativeInt));
		assert_eq!(binary_numeric_result(NativeInt, Int32, true), Some(NativeInt));
		assert_eq!(binary_numeric_result(NativeInt, NativeInt, true), Some(NativeInt));
		assert_eq!(binary_numeric_result(Float, Float, true), Some(Float));
	}

	#[test]
	fn forbidden_numeric_pairs_are_rejected() {
		assert_eq!(binary_numeric_result(Int32, Int64, true), None);
		assert_eq!(binary_numeric_result(Int64, NativeInt, true), None);
		assert_eq!(binary_numeric_result(Float, Int32, true), None);
		assert_eq!(binary_numeric_result(Float, Float, false), None);
		assert_eq!(binary_numeric_result(ObjRef, ObjRef, true), None);
		assert_eq!(binary_numeric_result(ByRef, Int32, true), None);
	}
}
