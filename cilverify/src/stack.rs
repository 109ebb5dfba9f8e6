use std::fmt::{Debug, Formatter};

use bitflags::bitflags;

use crate::typesystem::{TypeKind, TypeSystem};

/// Kind tag of one evaluation-stack slot.
///
/// The tag is deliberately coarse: everything the ECMA-335 stack transition
/// tables reason about is one of these, with the precise type identity (when
/// there is one) attached to the slot separately.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SlotKind {
	Int32,
	Int64,
	NativeInt,
	Float,
	ObjRef,
	ByRef,
	ValueType,
	/// Reserved for slots no dispatch rule constrains.
	Unknown,
}

bitflags! {
	/// Orthogonal slot attributes; never encoded into the kind tag.
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SlotFlags: u8 {
		/// Controlled-mutability managed pointer; stores through it are rejected.
		const READ_ONLY = 0x1;
		/// Points at storage that outlives this frame.
		const PERMANENT_HOME = 0x2;
		/// The unmodified `this` argument of the current method.
		const THIS_PTR = 0x4;
	}
}

/// One slot of the abstract evaluation stack.
///
/// `ty` is the attached type identity: the element type for by-refs, the
/// object type for object references (`None` marks the null reference), the
/// exact type for value types. Plain numeric slots carry no identity.
/// `method` is attached to native-int slots produced by `ldftn`/`ldvirtftn`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct StackSlot<Ty, M> {
	kind: SlotKind,
	ty: Option<Ty>,
	method: Option<M>,
	flags: SlotFlags,
}

impl<Ty: Debug, M: Debug> Debug for StackSlot<Ty, M> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match (&self.ty, &self.method) {
			(None, None) => write!(f, "{:?}", self.kind)?,
			(Some(ty), _) => write!(f, "{:?}({:?})", self.kind, ty)?,
			(None, Some(method)) => write!(f, "{:?}(fn {:?})", self.kind, method)?,
		}
		match self.flags.is_empty() {
			true => Ok(()),
			false => write!(f, "[{:?}]", self.flags),
		}
	}
}

impl<Ty: Copy + Eq, M: Copy + Eq> StackSlot<Ty, M> {
	const fn new(kind: SlotKind, ty: Option<Ty>) -> Self {
		Self { kind, ty, method: None, flags: SlotFlags::empty() }
	}

	pub const fn int32() -> Self {
		Self::new(SlotKind::Int32, None)
	}

	pub const fn int64() -> Self {
		Self::new(SlotKind::Int64, None)
	}

	pub const fn native_int() -> Self {
		Self::new(SlotKind::NativeInt, None)
	}

	pub const fn float() -> Self {
		Self::new(SlotKind::Float, None)
	}

	pub const fn null_ref() -> Self {
		Self::new(SlotKind::ObjRef, None)
	}

	pub const fn obj_ref(ty: Ty) -> Self {
		Self::new(SlotKind::ObjRef, Some(ty))
	}

	pub const fn byref(element: Ty) -> Self {
		Self::new(SlotKind::ByRef, Some(element))
	}

	pub const fn value_type(ty: Ty) -> Self {
		Self::new(SlotKind::ValueType, Some(ty))
	}

	/// A method pointer: native int with the method identity attached.
	pub const fn method_pointer(method: M) -> Self {
		Self { kind: SlotKind::NativeInt, ty: None, method: Some(method), flags: SlotFlags::empty() }
	}

	/// The slot an operand of type `ty` occupies when loaded onto the stack.
	pub fn of_type<T: TypeSystem<Type = Ty, Method = M>>(sys: &T, ty: Ty) -> Self {
		match sys.kind(ty) {
			TypeKind::Bool
			| TypeKind::Char
			| TypeKind::Int8 | TypeKind::UInt8
			| TypeKind::Int16 | TypeKind::UInt16
			| TypeKind::Int32 | TypeKind::UInt32 => Self::int32(),
			TypeKind::Int64 | TypeKind::UInt64 => Self::int64(),
			TypeKind::Single | TypeKind::Double => Self::float(),
			TypeKind::IntPtr | TypeKind::UIntPtr
			| TypeKind::Pointer | TypeKind::FunctionPointer => Self::native_int(),
			TypeKind::Enum => Self::of_type(sys, sys.enum_underlying(ty)),
			TypeKind::ByRef => {
				let element = sys.element_type(ty).expect("by-ref type without an element");
				Self::byref(element)
			}
			TypeKind::ValueType | TypeKind::GenericParameter => Self::value_type(ty),
			TypeKind::Array | TypeKind::Class | TypeKind::Interface
			| TypeKind::Object | TypeKind::String => Self::obj_ref(ty),
		}
	}

	#[inline]
	pub fn kind(&self) -> SlotKind {
		self.kind
	}

	#[inline]
	pub fn type_identity(&self) -> Option<Ty> {
		self.ty
	}

	#[inline]
	pub fn method_identity(&self) -> Option<M> {
		self.method
	}

	#[inline]
	pub fn flags(&self) -> SlotFlags {
		self.flags
	}

	pub fn with_flags(mut self, flags: SlotFlags) -> Self {
		self.flags = flags;
		self
	}

	pub fn with_flag(mut self, flag: SlotFlags) -> Self {
		self.flags |= flag;
		self
	}

	#[inline]
	pub fn has(&self, flag: SlotFlags) -> bool {
		self.flags.contains(flag)
	}

	/// Null object reference: an ObjRef slot with no type identity.
	#[inline]
	pub fn is_null(&self) -> bool {
		self.kind == SlotKind::ObjRef && self.ty.is_none()
	}

	pub fn is_read_only(&self) -> bool {
		self.has(SlotFlags::READ_ONLY)
	}

	pub fn has_permanent_home(&self) -> bool {
		self.has(SlotFlags::PERMANENT_HOME)
	}

	pub fn is_this_ptr(&self) -> bool {
		self.has(SlotFlags::THIS_PTR)
	}
}
