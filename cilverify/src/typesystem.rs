use std::fmt::Debug;
use std::hash::Hash;

use crate::metadata_token::MetadataToken;
use crate::regions::ExceptionRegion;

/// Shape of a type as the verifier needs to see it.
///
/// Enums and generic parameters keep their own kind; the stack-slot mapping
/// and the lattice decide how they flow.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TypeKind {
	Bool,
	Char,
	Int8,
	UInt8,
	Int16,
	UInt16,
	Int32,
	UInt32,
	Int64,
	UInt64,
	IntPtr,
	UIntPtr,
	Single,
	Double,
	Enum,
	Pointer,
	FunctionPointer,
	ByRef,
	Array,
	Class,
	Interface,
	ValueType,
	GenericParameter,
	Object,
	String,
}

impl TypeKind {
	pub fn is_primitive(&self) -> bool {
		matches!(
			self,
			TypeKind::Bool
				| TypeKind::Char
				| TypeKind::Int8 | TypeKind::UInt8
				| TypeKind::Int16 | TypeKind::UInt16
				| TypeKind::Int32 | TypeKind::UInt32
				| TypeKind::Int64 | TypeKind::UInt64
				| TypeKind::IntPtr | TypeKind::UIntPtr
				| TypeKind::Single | TypeKind::Double
		)
	}

	/// Types whose values live on the stack inline rather than behind an
	/// object reference.
	pub fn is_value(&self) -> bool {
		self.is_primitive()
			|| matches!(
				self,
				TypeKind::Enum | TypeKind::ValueType | TypeKind::Pointer | TypeKind::FunctionPointer
			)
	}

	pub fn is_reference(&self) -> bool {
		matches!(
			self,
			TypeKind::Array | TypeKind::Class | TypeKind::Interface | TypeKind::Object | TypeKind::String
		)
	}
}

/// Handles the verifier asks the oracle for by name.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WellKnownType {
	SByte,
	Int16,
	Int32,
	Int64,
	IntPtr,
	Single,
	Double,
	Object,
	String,
	/// `System.Array`, the common base of every array shape.
	Array,
	/// The system exception base class seeded into handler entry stacks.
	Exception,
	TypedReference,
	RuntimeTypeHandle,
	RuntimeFieldHandle,
	RuntimeMethodHandle,
	RuntimeArgumentHandle,
}

/// Reflective questions the verifier asks about types, methods and fields.
///
/// Every query is answerable from metadata alone; implementations may be
/// backed by a live runtime or by an offline metadata reader. Handles are
/// plain copyable identities; the verifier never inspects them beyond
/// equality.
pub trait TypeSystem {
	type Type: Copy + Eq + Hash + Debug;
	type Method: Copy + Eq + Hash + Debug;
	type Field: Copy + Eq + Hash + Debug;

	fn kind(&self, ty: Self::Type) -> TypeKind;
	/// Element of a by-ref, pointer or array type.
	fn element_type(&self, ty: Self::Type) -> Option<Self::Type>;
	fn array_rank(&self, ty: Self::Type) -> u32;
	fn is_sz_array(&self, ty: Self::Type) -> bool;
	fn enum_underlying(&self, ty: Self::Type) -> Self::Type;
	fn base_type(&self, ty: Self::Type) -> Option<Self::Type>;
	/// Directly implemented (or extended) interfaces, in declaration order.
	fn interfaces(&self, ty: Self::Type) -> Vec<Self::Type>;
	/// Full transitive assignability, including identity.
	fn is_assignable_to(&self, ty: Self::Type, to: Self::Type) -> bool;
	fn is_abstract(&self, ty: Self::Type) -> bool;
	fn well_known(&self, which: WellKnownType) -> Self::Type;
	fn sz_array_of(&self, element: Self::Type) -> Self::Type;
	fn array_of(&self, element: Self::Type, rank: u32) -> Self::Type;

	/// Explicit parameter types, excluding any implicit `this`.
	fn method_parameters(&self, method: Self::Method) -> Vec<Self::Type>;
	/// `None` for void.
	fn method_return_type(&self, method: Self::Method) -> Option<Self::Type>;
	fn method_is_static(&self, method: Self::Method) -> bool;
	fn method_is_abstract(&self, method: Self::Method) -> bool;
	fn method_is_virtual(&self, method: Self::Method) -> bool;
	/// Instance or type constructors both count.
	fn method_is_constructor(&self, method: Self::Method) -> bool;
	fn method_declaring_type(&self, method: Self::Method) -> Self::Type;
	fn method_is_accessible(&self, method: Self::Method, from: Self::Type) -> bool;

	fn field_type(&self, field: Self::Field) -> Self::Type;
	fn field_is_static(&self, field: Self::Field) -> bool;
	fn field_is_init_only(&self, field: Self::Field) -> bool;
	fn field_declaring_type(&self, field: Self::Field) -> Self::Type;
	fn field_is_accessible(&self, field: Self::Field, from: Self::Type) -> bool;

	/// Token resolution in the generic context of the method under
	/// verification. `None` means the token does not name a suitable entity.
	fn resolve_type(&self, token: MetadataToken, context: Self::Method) -> Option<Self::Type>;
	fn resolve_method(&self, token: MetadataToken, context: Self::Method) -> Option<Self::Method>;
	fn resolve_field(&self, token: MetadataToken, context: Self::Method) -> Option<Self::Field>;
}

/// Raw method-body facts, as decoded from the method header by the loader.
pub trait BytecodeSource<T: TypeSystem> {
	fn il_bytes(&self, method: T::Method) -> &[u8];
	fn locals(&self, method: T::Method) -> Vec<T::Type>;
	fn exception_regions(&self, method: T::Method) -> Vec<ExceptionRegion<T::Type>>;
	fn is_vararg(&self, method: T::Method) -> bool;
	/// The `.maxstack` declared in the method header.
	fn max_stack(&self, method: T::Method) -> u32;
	/// The localsinit flag; required when the method declares locals.
	fn init_locals(&self, method: T::Method) -> bool;
}
