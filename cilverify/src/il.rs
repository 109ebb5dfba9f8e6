use std::fmt::{Debug, Formatter};
use std::io::{Cursor, ErrorKind};
use std::io::Result;

use bitflags::bitflags;

use crate::metadata_token::MetadataToken;
use crate::utilities::{read_bytes_slice_from_stream, FromByteStream};

macro_rules! debug_opcode {
	($name: ident, $f: expr, $self: expr, $ident: ident) => {
		if $name::$ident == *$self {
			return write!($f, "OpCode::{}", stringify!($ident));
		}
	};
	($name: ident, $f: expr, $self: expr, $ident: ident ($ty: ty)) => {
		if let $name::$ident(v) = $self {
			return write!($f, "OpCode::{}({:#X?})", stringify!($ident), v);
		}
	};
}

macro_rules! define_opcodes {
	(
		enum $name: ident $(<$lifetime: lifetime>)? {
			$(
				$(#[$attr:meta])*
				$ident: ident $(($ty: ty))? = $discriminant: literal
			),*
		}
	) => {
		#[repr(u8)]
		#[allow(non_camel_case_types)]
		#[derive(Copy, Clone, PartialEq)]
		pub enum $name $(<$lifetime>)? {
			$(
				$(#[$attr])*
				$ident $(($ty))? = $discriminant
			),*
		}

		impl$(<$lifetime>)? $name$(<$lifetime>)? {
			pub fn read(stream: &mut Cursor<& $($lifetime)? [u8]>) -> Result<Self> {
				let discriminant = u8::read(stream)?;
				match discriminant {
					$($discriminant => Ok($name::$ident $((<$ty>::read(stream)?))?),)*
					_ => Err(ErrorKind::InvalidData.into()),
				}
			}
		}

		impl $(<$lifetime>)? Debug for $name $(<$lifetime>)? {
			fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
				$(debug_opcode! { $name, f, self, $ident $(($ty))? })*
				Ok(())
			}
		}
	};
}

define_opcodes! {
	enum OpCode<'l> {
		nop = 0x00,
		/// Signal a debugger breakpoint.
		dbg_break = 0x01,
		ldarg_0 = 0x02,
		ldarg_1 = 0x03,
		ldarg_2 = 0x04,
		ldarg_3 = 0x05,
		ldloc_0 = 0x06,
		ldloc_1 = 0x07,
		ldloc_2 = 0x08,
		ldloc_3 = 0x09,
		stloc_0 = 0x0A,
		stloc_1 = 0x0B,
		stloc_2 = 0x0C,
		stloc_3 = 0x0D,
		ldarg_s(u8) = 0x0E,
		/// Push the address of the numbered argument, short form.
		ldarga_s(u8) = 0x0F,
		starg_s(u8) = 0x10,
		ldloc_s(u8) = 0x11,
		/// Push the address of the numbered local, short form.
		ldloca_s(u8) = 0x12,
		stloc_s(u8) = 0x13,
		/// Push a null object reference.
		ldnull = 0x14,
		ldc_i4_m1 = 0x15,
		ldc_i4_0 = 0x16,
		ldc_i4_1 = 0x17,
		ldc_i4_2 = 0x18,
		ldc_i4_3 = 0x19,
		ldc_i4_4 = 0x1A,
		ldc_i4_5 = 0x1B,
		ldc_i4_6 = 0x1C,
		ldc_i4_7 = 0x1D,
		ldc_i4_8 = 0x1E,
		ldc_i4_s(i8) = 0x1F,
		ldc_i4(i32) = 0x20,
		ldc_i8(i64) = 0x21,
		ldc_r4(f32) = 0x22,
		ldc_r8(f64) = 0x23,
		/// Duplicate the top stack slot.
		dup = 0x25,
		/// Discard the top stack slot.
		pop = 0x26,
		/// Transfer control to the target method, abandoning this frame.
		jmp(MetadataToken) = 0x27,
		call(MetadataToken) = 0x28,
		/// Call through a function pointer with the given call-site signature.
		calli(MetadataToken) = 0x29,
		ret = 0x2A,
		br_s(i8) = 0x2B,
		brfalse_s(i8) = 0x2C,
		brtrue_s(i8) = 0x2D,
		beq_s(i8) = 0x2E,
		bge_s(i8) = 0x2F,
		bgt_s(i8) = 0x30,
		ble_s(i8) = 0x31,
		blt_s(i8) = 0x32,
		bne_un_s(i8) = 0x33,
		bge_un_s(i8) = 0x34,
		bgt_un_s(i8) = 0x35,
		ble_un_s(i8) = 0x36,
		blt_un_s(i8) = 0x37,
		br(i32) = 0x38,
		brfalse(i32) = 0x39,
		brtrue(i32) = 0x3A,
		beq(i32) = 0x3B,
		bge(i32) = 0x3C,
		bgt(i32) = 0x3D,
		ble(i32) = 0x3E,
		blt(i32) = 0x3F,
		bne_un(i32) = 0x40,
		bge_un(i32) = 0x41,
		bgt_un(i32) = 0x42,
		ble_un(i32) = 0x43,
		blt_un(i32) = 0x44,
		/// Jump to one of n targets by zero-based index.
		switch(SwitchTable<'l>) = 0x45,
		ldind_i1 = 0x46,
		ldind_u1 = 0x47,
		ldind_i2 = 0x48,
		ldind_u2 = 0x49,
		ldind_i4 = 0x4A,
		ldind_u4 = 0x4B,
		ldind_i8 = 0x4C,
		ldind_i = 0x4D,
		ldind_r4 = 0x4E,
		ldind_r8 = 0x4F,
		ldind_ref = 0x50,
		stind_ref = 0x51,
		stind_i1 = 0x52,
		stind_i2 = 0x53,
		stind_i4 = 0x54,
		stind_i8 = 0x55,
		stind_r4 = 0x56,
		stind_r8 = 0x57,
		add = 0x58,
		sub = 0x59,
		mul = 0x5A,
		div = 0x5B,
		div_un = 0x5C,
		rem = 0x5D,
		rem_un = 0x5E,
		and = 0x5F,
		or = 0x60,
		xor = 0x61,
		shl = 0x62,
		shr = 0x63,
		shr_un = 0x64,
		neg = 0x65,
		not = 0x66,
		conv_i1 = 0x67,
		conv_i2 = 0x68,
		conv_i4 = 0x69,
		conv_i8 = 0x6A,
		conv_r4 = 0x6B,
		conv_r8 = 0x6C,
		conv_u4 = 0x6D,
		conv_u8 = 0x6E,
		callvirt(MetadataToken) = 0x6F,
		/// Copy the value at the source address to the destination address.
		cpobj(MetadataToken) = 0x70,
		/// Load the value at an address onto the stack.
		ldobj(MetadataToken) = 0x71,
		ldstr(MetadataToken) = 0x72,
		newobj(MetadataToken) = 0x73,
		castclass(MetadataToken) = 0x74,
		/// Test whether the object is an instance of the class, pushing it or null.
		isinst(MetadataToken) = 0x75,
		conv_r_un = 0x76,
		/// Push a controlled-mutability pointer into the boxed representation.
		unbox(MetadataToken) = 0x79,
		throw = 0x7A,
		ldfld(MetadataToken) = 0x7B,
		ldflda(MetadataToken) = 0x7C,
		stfld(MetadataToken) = 0x7D,
		ldsfld(MetadataToken) = 0x7E,
		ldsflda(MetadataToken) = 0x7F,
		stsfld(MetadataToken) = 0x80,
		/// Store a value of the given type at an address.
		stobj(MetadataToken) = 0x81,
		conv_ovf_i1_un = 0x82,
		conv_ovf_i2_un = 0x83,
		conv_ovf_i4_un = 0x84,
		conv_ovf_i8_un = 0x85,
		conv_ovf_u1_un = 0x86,
		conv_ovf_u2_un = 0x87,
		conv_ovf_u4_un = 0x88,
		conv_ovf_u8_un = 0x89,
		conv_ovf_i_un = 0x8A,
		conv_ovf_u_un = 0x8B,
		box_val(MetadataToken) = 0x8C,
		newarr(MetadataToken) = 0x8D,
		ldlen = 0x8E,
		/// Push the address of the element at the given index.
		ldelema(MetadataToken) = 0x8F,
		ldelem_i1 = 0x90,
		ldelem_u1 = 0x91,
		ldelem_i2 = 0x92,
		ldelem_u2 = 0x93,
		ldelem_i4 = 0x94,
		ldelem_u4 = 0x95,
		ldelem_i8 = 0x96,
		ldelem_i = 0x97,
		ldelem_r4 = 0x98,
		ldelem_r8 = 0x99,
		ldelem_ref = 0x9A,
		stelem_i = 0x9B,
		stelem_i1 = 0x9C,
		stelem_i2 = 0x9D,
		stelem_i4 = 0x9E,
		stelem_i8 = 0x9F,
		stelem_r4 = 0xA0,
		stelem_r8 = 0xA1,
		stelem_ref = 0xA2,
		ldelem(MetadataToken) = 0xA3,
		stelem(MetadataToken) = 0xA4,
		/// Unbox to the value itself (value types) or cast (reference types).
		unbox_any(MetadataToken) = 0xA5,
		conv_ovf_i1 = 0xB3,
		conv_ovf_u1 = 0xB4,
		conv_ovf_i2 = 0xB5,
		conv_ovf_u2 = 0xB6,
		conv_ovf_i4 = 0xB7,
		conv_ovf_u4 = 0xB8,
		conv_ovf_i8 = 0xB9,
		conv_ovf_u8 = 0xBA,
		/// Push the address held by a typed reference.
		refanyval(MetadataToken) = 0xC2,
		ckfinite = 0xC3,
		/// Build a typed reference from an address.
		mkrefany(MetadataToken) = 0xC6,
		/// Push the runtime handle for a metadata token.
		ldtoken(MetadataToken) = 0xD0,
		conv_u2 = 0xD1,
		conv_u1 = 0xD2,
		conv_i = 0xD3,
		conv_ovf_i = 0xD4,
		conv_ovf_u = 0xD5,
		add_ovf = 0xD6,
		add_ovf_un = 0xD7,
		mul_ovf = 0xD8,
		mul_ovf_un = 0xD9,
		sub_ovf = 0xDA,
		sub_ovf_un = 0xDB,
		/// End a finally or fault clause.
		endfinally = 0xDC,
		/// Exit a protected region, targeting an offset outside it.
		leave(i32) = 0xDD,
		leave_s(i8) = 0xDE,
		stind_i = 0xDF,
		conv_u = 0xE0,
		extended(ExtendedOpCode) = 0xFE
	}
}

define_opcodes! {
	enum ExtendedOpCode {
		/// Push the argument-list handle of the current vararg method.
		arglist = 0x00,
		ceq = 0x01,
		cgt = 0x02,
		cgt_un = 0x03,
		clt = 0x04,
		clt_un = 0x05,
		/// Push a pointer to the named method.
		ldftn(MetadataToken) = 0x06,
		/// Push a pointer to the named method resolved through the object's vtable.
		ldvirtftn(MetadataToken) = 0x07,
		ldarg(u16) = 0x09,
		ldarga(u16) = 0x0A,
		starg(u16) = 0x0B,
		ldloc(u16) = 0x0C,
		ldloca(u16) = 0x0D,
		stloc(u16) = 0x0E,
		/// Allocate from the local memory pool.
		localloc = 0x0F,
		/// End a filter clause, leaving the decision value on the stack.
		endfilter = 0x11,
		/// Prefix: the next pointer access may be unaligned to the given boundary.
		unaligned(u8) = 0x12,
		/// Prefix: the next pointer access is volatile.
		volatile = 0x13,
		/// Prefix: the next call terminates this frame.
		tail = 0x14,
		/// Zero-initialise the value at an address.
		initobj(MetadataToken) = 0x15,
		/// Prefix: constrain the receiver of the next callvirt to the given type.
		constrained(MetadataToken) = 0x16,
		cpblk = 0x17,
		initblk = 0x18,
		/// Prefix: skip the named runtime fault checks on the next instruction.
		no_chk(SkipFaultCheckFlags) = 0x19,
		/// Re-raise the exception being handled.
		rethrow = 0x1A,
		/// Push the size in bytes of the given type.
		sizeof(MetadataToken) = 0x1C,
		/// Push the type token held by a typed reference.
		refanytype = 0x1D,
		/// Prefix: the next ldelema skips the type check and yields a read-only pointer.
		readonly = 0x1E
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct SkipFaultCheckFlags: u8 {
		const TYPE_CHECK = 0x1;
		const RANGE_CHECK = 0x2;
		const NULL_CHECK = 0x4;
	}
}

impl FromByteStream for SkipFaultCheckFlags {
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>) -> Result<Self> {
		let bits = u8::read(stream)?;
		Self::from_bits(bits).ok_or_else(|| ErrorKind::InvalidData.into())
	}
}

/// The jump table of a `switch` instruction, kept as the raw little-endian
/// bytes it was decoded from.
#[derive(Copy, Clone, PartialEq, Hash)]
pub struct SwitchTable<'l>(&'l [u8]);

impl Debug for SwitchTable<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_list();
		for target in self.deltas() {
			dbg.entry(&target);
		}
		dbg.finish()
	}
}

impl<'l> SwitchTable<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>) -> Result<Self> {
		let len = u32::read(stream)?;
		let data = read_bytes_slice_from_stream(stream, len as usize * 4)?;
		Ok(Self(data))
	}

	pub fn len(&self) -> usize {
		self.0.len() / 4
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Relative deltas, as encoded.
	#[inline]
	pub fn deltas(&self) -> impl Iterator<Item = i32> + '_ {
		(0..self.len()).map(move |i| {
			let slice = &self.0[i * 4..(i + 1) * 4];
			i32::from_le_bytes(slice.try_into().unwrap())
		})
	}

	/// Absolute target offsets, given the offset of the instruction that
	/// follows the switch.
	#[inline]
	pub fn targets(&self, next_offset: u32) -> impl Iterator<Item = i64> + '_ {
		self.deltas().map(move |delta| next_offset as i64 + delta as i64)
	}
}

/// Walks an IL byte stream one instruction at a time.
///
/// Yields the starting offset of each instruction together with its decode
/// result; [`OpCodeIterator::offset`] reports the offset one past the
/// instruction most recently yielded.
pub struct OpCodeIterator<'l> {
	cursor: Cursor<&'l [u8]>,
}

impl<'l> OpCodeIterator<'l> {
	pub fn new(bytes: &'l [u8]) -> Self {
		Self { cursor: Cursor::new(bytes) }
	}

	pub fn starting_at(bytes: &'l [u8], offset: u32) -> Self {
		let mut cursor = Cursor::new(bytes);
		cursor.set_position(offset as u64);
		Self { cursor }
	}

	#[inline]
	pub fn offset(&self) -> u32 {
		self.cursor.position() as u32
	}
}

impl<'l> Iterator for OpCodeIterator<'l> {
	type Item = (u32, Result<OpCode<'l>>);
	fn next(&mut self) -> Option<Self::Item> {
		let position = self.cursor.position();
		match position == self.cursor.get_ref().len() as u64 {
			true => None,
			false => Some((position as u32, OpCode::read(&mut self.cursor))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_single_byte_opcodes() {
		let il = [0x00, 0x17, 0x2A]; // nop; ldc.i4.1; ret
		let decoded: Vec<_> = OpCodeIterator::new(&il).map(|(o, op)| (o, op.unwrap())).collect();
		assert_eq!(decoded.len(), 3);
		assert_eq!(decoded[0], (0, OpCode::nop));
		assert_eq!(decoded[1], (1, OpCode::ldc_i4_1));
		assert_eq!(decoded[2], (2, OpCode::ret));
	}

	#[test]
	fn decodes_inline_operands() {
		let mut il = vec![0x20]; // ldc.i4
		il.extend_from_slice(&0x1234_5678i32.to_le_bytes());
		il.push(0x23); // ldc.r8
		il.extend_from_slice(&1.5f64.to_le_bytes());
		let decoded: Vec<_> = OpCodeIterator::new(&il).map(|(_, op)| op.unwrap()).collect();
		assert_eq!(decoded, vec![OpCode::ldc_i4(0x1234_5678), OpCode::ldc_r8(1.5)]);
	}

	#[test]
	fn decodes_extended_opcodes() {
		let il = [0xFE, 0x01, 0xFE, 0x12, 0x04]; // ceq; unaligned. 4
		let decoded: Vec<_> = OpCodeIterator::new(&il).map(|(_, op)| op.unwrap()).collect();
		assert_eq!(decoded, vec![
			OpCode::extended(ExtendedOpCode::ceq),
			OpCode::extended(ExtendedOpCode::unaligned(4)),
		]);
	}

	#[test]
	fn decodes_switch_tables() {
		let mut il = vec![0x45];
		il.extend_from_slice(&2u32.to_le_bytes());
		il.extend_from_slice(&5i32.to_le_bytes());
		il.extend_from_slice(&(-3i32).to_le_bytes());
		let (offset, op) = OpCodeIterator::new(&il).next().unwrap();
		assert_eq!(offset, 0);
		let OpCode::switch(table) = op.unwrap() else { panic!("expected switch") };
		assert_eq!(table.len(), 2);
		assert_eq!(table.deltas().collect::<Vec<_>>(), vec![5, -3]);
		assert_eq!(table.targets(13).collect::<Vec<_>>(), vec![18, 10]);
	}

	#[test]
	fn truncated_operand_reports_eof() {
		let il = [0x20, 0x01, 0x02]; // ldc.i4 with 3 of 4 operand bytes
		let (_, op) = OpCodeIterator::new(&il).next().unwrap();
		assert_eq!(op.unwrap_err().kind(), ErrorKind::UnexpectedEof);
	}

	#[test]
	fn truncated_switch_reports_eof() {
		let mut il = vec![0x45];
		il.extend_from_slice(&4u32.to_le_bytes());
		il.extend_from_slice(&0i32.to_le_bytes()); // only 1 of 4 entries present
		let (_, op) = OpCodeIterator::new(&il).next().unwrap();
		assert_eq!(op.unwrap_err().kind(), ErrorKind::UnexpectedEof);
	}

	#[test]
	fn unknown_opcode_is_invalid_data() {
		for byte in [0x24u8, 0xA6, 0xF0] {
			let il = [byte];
			let (_, op) = OpCodeIterator::new(&il).next().unwrap();
			assert_eq!(op.unwrap_err().kind(), ErrorKind::InvalidData);
		}
		let il = [0xFE, 0x30]; // unknown extended opcode
		let (_, op) = OpCodeIterator::new(&il).next().unwrap();
		assert_eq!(op.unwrap_err().kind(), ErrorKind::InvalidData);
	}

	#[test]
	fn reader_advances_by_documented_lengths() {
		let mut il = vec![0x0E, 0x02]; // ldarg.s 2
		il.push(0x2B);
		il.push(0x05); // br.s +5
		il.push(0xFE);
		il.push(0x0C);
		il.extend_from_slice(&7u16.to_le_bytes()); // ldloc 7
		let offsets: Vec<_> = OpCodeIterator::new(&il).map(|(o, op)| { op.unwrap(); o }).collect();
		assert_eq!(offsets, vec![0, 2, 4]);
	}
}
