//! Shared test harness: an in-memory type universe implementing the oracle
//! traits, a tiny IL assembler, and helpers for running the verifier.

#![allow(dead_code)]

use std::cell::RefCell;

use cilverify::errors::{ErrorKind, VerificationFailure};
use cilverify::metadata_token::{MetadataToken, MetadataTokenKind};
use cilverify::regions::{ExceptionRegion, RegionKind};
use cilverify::typesystem::{BytecodeSource, TypeKind, TypeSystem, WellKnownType};
use cilverify::verifier::{verify, VerifierOptions};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Ty(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Me(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Fi(pub u32);

pub const OBJECT: Ty = Ty(0);
pub const STRING: Ty = Ty(1);
pub const SBYTE: Ty = Ty(2);
pub const BYTE: Ty = Ty(3);
pub const BOOL: Ty = Ty(4);
pub const CHAR: Ty = Ty(5);
pub const INT16: Ty = Ty(6);
pub const UINT16: Ty = Ty(7);
pub const INT32: Ty = Ty(8);
pub const UINT32: Ty = Ty(9);
pub const INT64: Ty = Ty(10);
pub const UINT64: Ty = Ty(11);
pub const INTPTR: Ty = Ty(12);
pub const UINTPTR: Ty = Ty(13);
pub const SINGLE: Ty = Ty(14);
pub const DOUBLE: Ty = Ty(15);
pub const ARRAY: Ty = Ty(16);
pub const EXCEPTION: Ty = Ty(17);
pub const TYPED_REFERENCE: Ty = Ty(18);
pub const RT_TYPE_HANDLE: Ty = Ty(19);
pub const RT_FIELD_HANDLE: Ty = Ty(20);
pub const RT_METHOD_HANDLE: Ty = Ty(21);
pub const RT_ARG_HANDLE: Ty = Ty(22);

#[derive(Debug, Clone)]
struct TypeDef {
	name: String,
	kind: TypeKind,
	base: Option<Ty>,
	interfaces: Vec<Ty>,
	element: Option<Ty>,
	rank: u32,
	sz: bool,
	underlying: Option<Ty>,
	is_abstract: bool,
}

impl TypeDef {
	fn new(name: &str, kind: TypeKind) -> Self {
		Self {
			name: name.to_string(),
			kind,
			base: None,
			interfaces: Vec::new(),
			element: None,
			rank: 0,
			sz: false,
			underlying: None,
			is_abstract: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Body {
	pub il: Vec<u8>,
	pub locals: Vec<Ty>,
	pub regions: Vec<ExceptionRegion<Ty>>,
	pub max_stack: u32,
	pub init_locals: bool,
	pub vararg: bool,
}

impl Default for Body {
	fn default() -> Self {
		Self {
			il: Vec::new(),
			locals: Vec::new(),
			regions: Vec::new(),
			max_stack: 8,
			init_locals: true,
			vararg: false,
		}
	}
}

impl Body {
	pub fn of(il: Vec<u8>) -> Self {
		Self { il, ..Self::default() }
	}

	pub fn with_locals(mut self, locals: Vec<Ty>) -> Self {
		self.locals = locals;
		self
	}

	pub fn with_regions(mut self, regions: Vec<ExceptionRegion<Ty>>) -> Self {
		self.regions = regions;
		self
	}
}

#[derive(Debug, Clone)]
pub struct MethodDef {
	pub declaring: Ty,
	pub params: Vec<Ty>,
	pub ret: Option<Ty>,
	pub is_static: bool,
	pub is_virtual: bool,
	pub is_abstract: bool,
	pub is_ctor: bool,
	pub accessible: bool,
	pub body: Option<Body>,
}

impl MethodDef {
	pub fn new(declaring: Ty) -> Self {
		Self {
			declaring,
			params: Vec::new(),
			ret: None,
			is_static: true,
			is_virtual: false,
			is_abstract: false,
			is_ctor: false,
			accessible: true,
			body: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct FieldDef {
	pub declaring: Ty,
	pub ty: Ty,
	pub is_static: bool,
	pub init_only: bool,
	pub accessible: bool,
}

impl FieldDef {
	pub fn new(declaring: Ty, ty: Ty) -> Self {
		Self { declaring, ty, is_static: false, init_only: false, accessible: true }
	}
}

/// The test oracle: a closed universe of types, methods and fields addressed
/// by plain indices. Arrays are interned on demand, which is the only reason
/// the type table sits behind a `RefCell`.
pub struct TestSys {
	types: RefCell<Vec<TypeDef>>,
	methods: Vec<MethodDef>,
	fields: Vec<FieldDef>,
}

impl TestSys {
	pub fn new() -> Self {
		let mut types = Vec::new();
		let mut push = |name: &str, kind: TypeKind, base: Option<Ty>| {
			let mut def = TypeDef::new(name, kind);
			def.base = base;
			types.push(def);
		};
		push("System.Object", TypeKind::Object, None);
		push("System.String", TypeKind::String, Some(OBJECT));
		push("System.SByte", TypeKind::Int8, Some(OBJECT));
		push("System.Byte", TypeKind::UInt8, Some(OBJECT));
		push("System.Boolean", TypeKind::Bool, Some(OBJECT));
		push("System.Char", TypeKind::Char, Some(OBJECT));
		push("System.Int16", TypeKind::Int16, Some(OBJECT));
		push("System.UInt16", TypeKind::UInt16, Some(OBJECT));
		push("System.Int32", TypeKind::Int32, Some(OBJECT));
		push("System.UInt32", TypeKind::UInt32, Some(OBJECT));
		push("System.Int64", TypeKind::Int64, Some(OBJECT));
		push("System.UInt64", TypeKind::UInt64, Some(OBJECT));
		push("System.IntPtr", TypeKind::IntPtr, Some(OBJECT));
		push("System.UIntPtr", TypeKind::UIntPtr, Some(OBJECT));
		push("System.Single", TypeKind::Single, Some(OBJECT));
		push("System.Double", TypeKind::Double, Some(OBJECT));
		push("System.Array", TypeKind::Class, Some(OBJECT));
		push("System.Exception", TypeKind::Class, Some(OBJECT));
		push("System.TypedReference", TypeKind::ValueType, Some(OBJECT));
		push("System.RuntimeTypeHandle", TypeKind::ValueType, Some(OBJECT));
		push("System.RuntimeFieldHandle", TypeKind::ValueType, Some(OBJECT));
		push("System.RuntimeMethodHandle", TypeKind::ValueType, Some(OBJECT));
		push("System.RuntimeArgumentHandle", TypeKind::ValueType, Some(OBJECT));
		Self { types: RefCell::new(types), methods: Vec::new(), fields: Vec::new() }
	}

	fn push_type(&mut self, def: TypeDef) -> Ty {
		let types = self.types.get_mut();
		types.push(def);
		Ty(types.len() as u32 - 1)
	}

	pub fn define_class(&mut self, name: &str, base: Option<Ty>) -> Ty {
		let mut def = TypeDef::new(name, TypeKind::Class);
		def.base = Some(base.unwrap_or(OBJECT));
		self.push_type(def)
	}

	pub fn define_abstract_class(&mut self, name: &str, base: Option<Ty>) -> Ty {
		let ty = self.define_class(name, base);
		self.types.get_mut()[ty.0 as usize].is_abstract = true;
		ty
	}

	pub fn define_interface(&mut self, name: &str) -> Ty {
		let mut def = TypeDef::new(name, TypeKind::Interface);
		def.is_abstract = true;
		self.push_type(def)
	}

	pub fn implement(&mut self, ty: Ty, interface: Ty) {
		self.types.get_mut()[ty.0 as usize].interfaces.push(interface);
	}

	pub fn define_value_type(&mut self, name: &str) -> Ty {
		let mut def = TypeDef::new(name, TypeKind::ValueType);
		def.base = Some(OBJECT);
		self.push_type(def)
	}

	pub fn define_enum(&mut self, name: &str, underlying: Ty) -> Ty {
		let mut def = TypeDef::new(name, TypeKind::Enum);
		def.base = Some(OBJECT);
		def.underlying = Some(underlying);
		self.push_type(def)
	}

	pub fn define_generic_param(&mut self, name: &str) -> Ty {
		self.push_type(TypeDef::new(name, TypeKind::GenericParameter))
	}

	pub fn define_byref(&mut self, element: Ty) -> Ty {
		let mut def = TypeDef::new("&", TypeKind::ByRef);
		def.element = Some(element);
		self.push_type(def)
	}

	pub fn add_method(&mut self, method: MethodDef) -> Me {
		self.methods.push(method);
		Me(self.methods.len() as u32 - 1)
	}

	pub fn add_field(&mut self, field: FieldDef) -> Fi {
		self.fields.push(field);
		Fi(self.fields.len() as u32 - 1)
	}

	fn intern_array(&self, element: Ty, rank: u32, sz: bool) -> Ty {
		let mut types = self.types.borrow_mut();
		let found = types.iter().position(|def| {
			def.kind == TypeKind::Array && def.sz == sz && def.rank == rank && def.element == Some(element)
		});
		match found {
			Some(index) => Ty(index as u32),
			None => {
				let mut def = TypeDef::new("[]", TypeKind::Array);
				def.base = Some(ARRAY);
				def.element = Some(element);
				def.rank = rank;
				def.sz = sz;
				types.push(def);
				Ty(types.len() as u32 - 1)
			}
		}
	}

	fn assignable(&self, from: Ty, to: Ty) -> bool {
		if from == to {
			return true;
		}
		let kind = self.kind(from);
		if to == OBJECT && kind.is_reference() {
			return true;
		}
		// base chain
		let mut current = self.base_type(from);
		while let Some(base) = current {
			if base == to {
				return true;
			}
			current = self.base_type(base);
		}
		// interface closure, through the base chain
		let mut stack = vec![from];
		while let Some(ty) = stack.pop() {
			let direct = self.types.borrow()[ty.0 as usize].interfaces.clone();
			for interface in direct {
				if interface == to {
					return true;
				}
				stack.push(interface);
			}
			if let Some(base) = self.base_type(ty) {
				stack.push(base);
			}
		}
		false
	}
}

impl TypeSystem for TestSys {
	type Type = Ty;
	type Method = Me;
	type Field = Fi;

	fn kind(&self, ty: Ty) -> TypeKind {
		self.types.borrow()[ty.0 as usize].kind
	}

	fn element_type(&self, ty: Ty) -> Option<Ty> {
		self.types.borrow()[ty.0 as usize].element
	}

	fn array_rank(&self, ty: Ty) -> u32 {
		self.types.borrow()[ty.0 as usize].rank
	}

	fn is_sz_array(&self, ty: Ty) -> bool {
		self.types.borrow()[ty.0 as usize].sz
	}

	fn enum_underlying(&self, ty: Ty) -> Ty {
		self.types.borrow()[ty.0 as usize].underlying.expect("enum without an underlying type")
	}

	fn base_type(&self, ty: Ty) -> Option<Ty> {
		self.types.borrow()[ty.0 as usize].base
	}

	fn interfaces(&self, ty: Ty) -> Vec<Ty> {
		self.types.borrow()[ty.0 as usize].interfaces.clone()
	}

	fn is_assignable_to(&self, ty: Ty, to: Ty) -> bool {
		self.assignable(ty, to)
	}

	fn is_abstract(&self, ty: Ty) -> bool {
		self.types.borrow()[ty.0 as usize].is_abstract
	}

	fn well_known(&self, which: WellKnownType) -> Ty {
		match which {
			WellKnownType::SByte => SBYTE,
			WellKnownType::Int16 => INT16,
			WellKnownType::Int32 => INT32,
			WellKnownType::Int64 => INT64,
			WellKnownType::IntPtr => INTPTR,
			WellKnownType::Single => SINGLE,
			WellKnownType::Double => DOUBLE,
			WellKnownType::Object => OBJECT,
			WellKnownType::String => STRING,
			WellKnownType::Array => ARRAY,
			WellKnownType::Exception => EXCEPTION,
			WellKnownType::TypedReference => TYPED_REFERENCE,
			WellKnownType::RuntimeTypeHandle => RT_TYPE_HANDLE,
			WellKnownType::RuntimeFieldHandle => RT_FIELD_HANDLE,
			WellKnownType::RuntimeMethodHandle => RT_METHOD_HANDLE,
			WellKnownType::RuntimeArgumentHandle => RT_ARG_HANDLE,
		}
	}

	fn sz_array_of(&self, element: Ty) -> Ty {
		self.intern_array(element, 1, true)
	}

	fn array_of(&self, element: Ty, rank: u32) -> Ty {
		self.intern_array(element, rank, false)
	}

	fn method_parameters(&self, method: Me) -> Vec<Ty> {
		self.methods[method.0 as usize].params.clone()
	}

	fn method_return_type(&self, method: Me) -> Option<Ty> {
		self.methods[method.0 as usize].ret
	}

	fn method_is_static(&self, method: Me) -> bool {
		self.methods[method.0 as usize].is_static
	}

	fn method_is_abstract(&self, method: Me) -> bool {
		self.methods[method.0 as usize].is_abstract
	}

	fn method_is_virtual(&self, method: Me) -> bool {
		self.methods[method.0 as usize].is_virtual
	}

	fn method_is_constructor(&self, method: Me) -> bool {
		self.methods[method.0 as usize].is_ctor
	}

	fn method_declaring_type(&self, method: Me) -> Ty {
		self.methods[method.0 as usize].declaring
	}

	fn method_is_accessible(&self, method: Me, _from: Ty) -> bool {
		self.methods[method.0 as usize].accessible
	}

	fn field_type(&self, field: Fi) -> Ty {
		self.fields[field.0 as usize].ty
	}

	fn field_is_static(&self, field: Fi) -> bool {
		self.fields[field.0 as usize].is_static
	}

	fn field_is_init_only(&self, field: Fi) -> bool {
		self.fields[field.0 as usize].init_only
	}

	fn field_declaring_type(&self, field: Fi) -> Ty {
		self.fields[field.0 as usize].declaring
	}

	fn field_is_accessible(&self, field: Fi, _from: Ty) -> bool {
		self.fields[field.0 as usize].accessible
	}

	fn resolve_type(&self, token: MetadataToken, _context: Me) -> Option<Ty> {
		let index = token.index().checked_sub(1)?;
		match token.kind() == MetadataTokenKind::TypeDef && index < self.types.borrow().len() {
			true => Some(Ty(index as u32)),
			false => None,
		}
	}

	fn resolve_method(&self, token: MetadataToken, _context: Me) -> Option<Me> {
		let index = token.index().checked_sub(1)?;
		match token.kind() == MetadataTokenKind::Method && index < self.methods.len() {
			true => Some(Me(index as u32)),
			false => None,
		}
	}

	fn resolve_field(&self, token: MetadataToken, _context: Me) -> Option<Fi> {
		let index = token.index().checked_sub(1)?;
		match token.kind() == MetadataTokenKind::Field && index < self.fields.len() {
			true => Some(Fi(index as u32)),
			false => None,
		}
	}
}

impl BytecodeSource<TestSys> for TestSys {
	fn il_bytes(&self, method: Me) -> &[u8] {
		&self.methods[method.0 as usize].body.as_ref().expect("method without a body").il
	}

	fn locals(&self, method: Me) -> Vec<Ty> {
		self.methods[method.0 as usize].body.as_ref().expect("method without a body").locals.clone()
	}

	fn exception_regions(&self, method: Me) -> Vec<ExceptionRegion<Ty>> {
		self.methods[method.0 as usize].body.as_ref().expect("method without a body").regions.clone()
	}

	fn is_vararg(&self, method: Me) -> bool {
		self.methods[method.0 as usize].body.as_ref().expect("method without a body").vararg
	}

	fn max_stack(&self, method: Me) -> u32 {
		self.methods[method.0 as usize].body.as_ref().expect("method without a body").max_stack
	}

	fn init_locals(&self, method: Me) -> bool {
		self.methods[method.0 as usize].body.as_ref().expect("method without a body").init_locals
	}
}

// ----------------------------------------------------------------- tokens

pub fn type_token(ty: Ty) -> u32 {
	0x0200_0000 | (ty.0 + 1)
}

pub fn method_token(method: Me) -> u32 {
	0x0600_0000 | (method.0 + 1)
}

pub fn field_token(field: Fi) -> u32 {
	0x0400_0000 | (field.0 + 1)
}

pub const STRING_TOKEN: u32 = 0x7000_0001;

// ------------------------------------------------------------------ regions

pub fn catch_region(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32, caught: Ty) -> ExceptionRegion<Ty> {
	ExceptionRegion {
		kind: RegionKind::Catch,
		try_offset,
		try_length,
		handler_offset,
		handler_length,
		filter_offset: None,
		caught_type: Some(caught),
	}
}

pub fn finally_region(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32) -> ExceptionRegion<Ty> {
	ExceptionRegion {
		kind: RegionKind::Finally,
		try_offset,
		try_length,
		handler_offset,
		handler_length,
		filter_offset: None,
		caught_type: None,
	}
}

pub fn fault_region(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32) -> ExceptionRegion<Ty> {
	ExceptionRegion {
		kind: RegionKind::Fault,
		..finally_region(try_offset, try_length, handler_offset, handler_length)
	}
}

pub fn filter_region(try_offset: u32, try_length: u32, filter_offset: u32, handler_offset: u32, handler_length: u32) -> ExceptionRegion<Ty> {
	ExceptionRegion {
		kind: RegionKind::Filter,
		try_offset,
		try_length,
		handler_offset,
		handler_length,
		filter_offset: Some(filter_offset),
		caught_type: None,
	}
}

// ---------------------------------------------------------------- assembler

/// Single-byte opcodes used by the tests.
pub mod op {
	pub const NOP: u8 = 0x00;
	pub const LDARG_0: u8 = 0x02;
	pub const LDARG_1: u8 = 0x03;
	pub const LDARG_2: u8 = 0x04;
	pub const LDLOC_0: u8 = 0x06;
	pub const LDLOC_1: u8 = 0x07;
	pub const STLOC_0: u8 = 0x0A;
	pub const STLOC_1: u8 = 0x0B;
	pub const LDARGA_S: u8 = 0x0F;
	pub const STARG_S: u8 = 0x10;
	pub const LDLOCA_S: u8 = 0x12;
	pub const LDNULL: u8 = 0x14;
	pub const LDC_I4_0: u8 = 0x16;
	pub const LDC_I4_1: u8 = 0x17;
	pub const LDC_I4_2: u8 = 0x18;
	pub const LDC_I4: u8 = 0x20;
	pub const LDC_I8: u8 = 0x21;
	pub const LDC_R4: u8 = 0x22;
	pub const LDC_R8: u8 = 0x23;
	pub const DUP: u8 = 0x25;
	pub const POP: u8 = 0x26;
	pub const CALL: u8 = 0x28;
	pub const RET: u8 = 0x2A;
	pub const BR_S: u8 = 0x2B;
	pub const BRFALSE_S: u8 = 0x2C;
	pub const BRTRUE_S: u8 = 0x2D;
	pub const BEQ_S: u8 = 0x2E;
	pub const BLT_S: u8 = 0x32;
	pub const BR: u8 = 0x38;
	pub const SWITCH: u8 = 0x45;
	pub const LDIND_I4: u8 = 0x4A;
	pub const STIND_I4: u8 = 0x54;
	pub const ADD: u8 = 0x58;
	pub const SUB: u8 = 0x59;
	pub const MUL: u8 = 0x5A;
	pub const DIV: u8 = 0x5B;
	pub const AND: u8 = 0x5F;
	pub const SHL: u8 = 0x62;
	pub const NEG: u8 = 0x65;
	pub const CONV_I4: u8 = 0x69;
	pub const CONV_R8: u8 = 0x6C;
	pub const CALLVIRT: u8 = 0x6F;
	pub const LDSTR: u8 = 0x72;
	pub const NEWOBJ: u8 = 0x73;
	pub const CASTCLASS: u8 = 0x74;
	pub const ISINST: u8 = 0x75;
	pub const UNBOX: u8 = 0x79;
	pub const THROW: u8 = 0x7A;
	pub const LDFLD: u8 = 0x7B;
	pub const LDFLDA: u8 = 0x7C;
	pub const STFLD: u8 = 0x7D;
	pub const LDSFLD: u8 = 0x7E;
	pub const STSFLD: u8 = 0x80;
	pub const BOX: u8 = 0x8C;
	pub const NEWARR: u8 = 0x8D;
	pub const LDLEN: u8 = 0x8E;
	pub const LDELEMA: u8 = 0x8F;
	pub const LDELEM_I4: u8 = 0x94;
	pub const STELEM_I4: u8 = 0x9E;
	pub const STELEM_REF: u8 = 0xA2;
	pub const UNBOX_ANY: u8 = 0xA5;
	pub const LDTOKEN: u8 = 0xD0;
	pub const ENDFINALLY: u8 = 0xDC;
	pub const LEAVE_S: u8 = 0xDE;

	/// Second bytes of the 0xFE-prefixed opcodes.
	pub const EXT: u8 = 0xFE;
	pub const CEQ: u8 = 0x01;
	pub const CGT_UN: u8 = 0x03;
	pub const LDFTN: u8 = 0x06;
	pub const LOCALLOC: u8 = 0x0F;
	pub const ENDFILTER: u8 = 0x11;
	pub const VOLATILE: u8 = 0x13;
	pub const TAIL: u8 = 0x14;
	pub const INITOBJ: u8 = 0x15;
	pub const CONSTRAINED: u8 = 0x16;
	pub const RETHROW: u8 = 0x1A;
	pub const SIZEOF: u8 = 0x1C;
	pub const READONLY: u8 = 0x1E;
}

/// A very small IL assembler for building method bodies in tests.
#[derive(Default)]
pub struct Asm {
	bytes: Vec<u8>,
}

impl Asm {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn op(mut self, byte: u8) -> Self {
		self.bytes.push(byte);
		self
	}

	pub fn ext(self, byte: u8) -> Self {
		self.op(op::EXT).op(byte)
	}

	pub fn int8(mut self, value: i8) -> Self {
		self.bytes.push(value as u8);
		self
	}

	pub fn uint8(mut self, value: u8) -> Self {
		self.bytes.push(value);
		self
	}

	pub fn uint16(mut self, value: u16) -> Self {
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn int32(mut self, value: i32) -> Self {
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn uint32(mut self, value: u32) -> Self {
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn int64(mut self, value: i64) -> Self {
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn float32(mut self, value: f32) -> Self {
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn float64(mut self, value: f64) -> Self {
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn token(self, raw: u32) -> Self {
		self.uint32(raw)
	}

	pub fn build(self) -> Vec<u8> {
		self.bytes
	}
}

// ------------------------------------------------------------------ running

pub fn run_verify(sys: &TestSys, method: Me) -> Result<(), VerificationFailure> {
	let declaring = sys.method_declaring_type(method);
	verify(sys, sys, method, declaring, &VerifierOptions::default())
}

#[track_caller]
pub fn expect_ok(sys: &TestSys, method: Me) {
	if let Err(failure) = run_verify(sys, method) {
		panic!("expected the method to verify, got: {failure}");
	}
}

#[track_caller]
pub fn expect_error(sys: &TestSys, method: Me) -> ErrorKind {
	match run_verify(sys, method) {
		Ok(()) => panic!("expected the method to fail verification"),
		Err(failure) => failure.first().kind,
	}
}
