//! Drives the verifier over a small hand-built type universe, with tracing
//! enabled, to eyeball the diagnostics it produces.

use cilverify::metadata_token::MetadataToken;
use cilverify::regions::ExceptionRegion;
use cilverify::typesystem::{BytecodeSource, TypeKind, TypeSystem, WellKnownType};
use cilverify::verifier::{verify, VerifierOptions};
use tracing::info;

const OBJECT: u32 = 0;
const STRING: u32 = 1;
const SBYTE: u32 = 2;
const INT16: u32 = 3;
const INT32: u32 = 4;
const INT64: u32 = 5;
const INTPTR: u32 = 6;
const SINGLE: u32 = 7;
const DOUBLE: u32 = 8;
const ARRAY: u32 = 9;
const EXCEPTION: u32 = 10;
const TYPED_REFERENCE: u32 = 11;
const RT_TYPE_HANDLE: u32 = 12;
const RT_FIELD_HANDLE: u32 = 13;
const RT_METHOD_HANDLE: u32 = 14;
const RT_ARG_HANDLE: u32 = 15;
const PROGRAM: u32 = 16;

const GOOD: u32 = 0;
const BROKEN: u32 = 1;

/// ldc.i4.1; ret
const GOOD_IL: &[u8] = &[0x17, 0x2A];
/// ldc.r8 1.0; ret — a float returned from an int method
const BROKEN_IL: &[u8] = &[0x23, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF0, 0x3F, 0x2A];

/// Just enough of a type universe to host two static `int()` methods.
struct Demo;

impl TypeSystem for Demo {
	type Type = u32;
	type Method = u32;
	type Field = u32;

	fn kind(&self, ty: u32) -> TypeKind {
		match ty {
			OBJECT => TypeKind::Object,
			STRING => TypeKind::String,
			SBYTE => TypeKind::Int8,
			INT16 => TypeKind::Int16,
			INT32 => TypeKind::Int32,
			INT64 => TypeKind::Int64,
			INTPTR => TypeKind::IntPtr,
			SINGLE => TypeKind::Single,
			DOUBLE => TypeKind::Double,
			TYPED_REFERENCE | RT_TYPE_HANDLE | RT_FIELD_HANDLE | RT_METHOD_HANDLE
			| RT_ARG_HANDLE => TypeKind::ValueType,
			_ => TypeKind::Class,
		}
	}

	fn element_type(&self, _ty: u32) -> Option<u32> {
		None
	}

	fn array_rank(&self, _ty: u32) -> u32 {
		0
	}

	fn is_sz_array(&self, _ty: u32) -> bool {
		false
	}

	fn enum_underlying(&self, ty: u32) -> u32 {
		ty
	}

	fn base_type(&self, ty: u32) -> Option<u32> {
		match ty {
			OBJECT => None,
			_ => Some(OBJECT),
		}
	}

	fn interfaces(&self, _ty: u32) -> Vec<u32> {
		Vec::new()
	}

	fn is_assignable_to(&self, ty: u32, to: u32) -> bool {
		ty == to || (to == OBJECT && self.kind(ty).is_reference())
	}

	fn is_abstract(&self, _ty: u32) -> bool {
		false
	}

	fn well_known(&self, which: WellKnownType) -> u32 {
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

	// the demo universe declares no array types
	fn sz_array_of(&self, _element: u32) -> u32 {
		ARRAY
	}

	fn array_of(&self, _element: u32, _rank: u32) -> u32 {
		ARRAY
	}

	fn method_parameters(&self, _method: u32) -> Vec<u32> {
		Vec::new()
	}

	fn method_return_type(&self, _method: u32) -> Option<u32> {
		Some(INT32)
	}

	fn method_is_static(&self, _method: u32) -> bool {
		true
	}

	fn method_is_abstract(&self, _method: u32) -> bool {
		false
	}

	fn method_is_virtual(&self, _method: u32) -> bool {
		false
	}

	fn method_is_constructor(&self, _method: u32) -> bool {
		false
	}

	fn method_declaring_type(&self, _method: u32) -> u32 {
		PROGRAM
	}

	fn method_is_accessible(&self, _method: u32, _from: u32) -> bool {
		true
	}

	fn field_type(&self, _field: u32) -> u32 {
		INT32
	}

	fn field_is_static(&self, _field: u32) -> bool {
		false
	}

	fn field_is_init_only(&self, _field: u32) -> bool {
		false
	}

	fn field_declaring_type(&self, _field: u32) -> u32 {
		PROGRAM
	}

	fn field_is_accessible(&self, _field: u32, _from: u32) -> bool {
		true
	}

	fn resolve_type(&self, _token: MetadataToken, _context: u32) -> Option<u32> {
		None
	}

	fn resolve_method(&self, _token: MetadataToken, _context: u32) -> Option<u32> {
		None
	}

	fn resolve_field(&self, _token: MetadataToken, _context: u32) -> Option<u32> {
		None
	}
}

impl BytecodeSource<Demo> for Demo {
	fn il_bytes(&self, method: u32) -> &[u8] {
		match method {
			GOOD => GOOD_IL,
			_ => BROKEN_IL,
		}
	}

	fn locals(&self, _method: u32) -> Vec<u32> {
		Vec::new()
	}

	fn exception_regions(&self, _method: u32) -> Vec<ExceptionRegion<u32>> {
		Vec::new()
	}

	fn is_vararg(&self, _method: u32) -> bool {
		false
	}

	fn max_stack(&self, _method: u32) -> u32 {
		8
	}

	fn init_locals(&self, _method: u32) -> bool {
		true
	}
}

fn main() {
	tracing_subscriber::fmt()
		.with_max_level(tracing::Level::DEBUG)
		.init();

	let demo = Demo;
	let options = VerifierOptions::default();

	for (name, method) in [("good", GOOD), ("broken", BROKEN)] {
		match verify(&demo, &demo, method, PROGRAM, &options) {
			Ok(()) => info!(name, "method verified"),
			Err(failure) => info!(name, %failure, "method rejected"),
		}
	}
}
